//! Commands replicated through consensus and their deterministic application

use crate::cluster::types::{
    ClusterServer, ClusterState, ConnectionInfo, ServerId, ServerRole, Shard, ShardDefinition,
    ShardId,
};
use crate::common::{select_replicas, Error};
use serde::{Deserialize, Serialize};

/// A mutation of the cluster configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterCommand {
    /// Appended by a new leader so entries of earlier terms can commit
    Noop,
    /// Add a server. Idempotent for the same identity and addresses.
    RegisterServer {
        raft_name: String,
        connection: ConnectionInfo,
        role: ServerRole,
    },
    /// Replace the addresses of an existing server in place
    CorrectAddress {
        raft_name: String,
        connection: ConnectionInfo,
    },
    RemoveServer {
        server_id: ServerId,
    },
    CreateShard {
        definition: ShardDefinition,
    },
    UpdateShardOwners {
        shard_id: ShardId,
        owners: Vec<ServerId>,
    },
    DropShard {
        shard_id: ShardId,
    },
}

impl ClusterCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ClusterCommand::Noop => "noop",
            ClusterCommand::RegisterServer { .. } => "register_server",
            ClusterCommand::CorrectAddress { .. } => "correct_address",
            ClusterCommand::RemoveServer { .. } => "remove_server",
            ClusterCommand::CreateShard { .. } => "create_shard",
            ClusterCommand::UpdateShardOwners { .. } => "update_shard_owners",
            ClusterCommand::DropShard { .. } => "drop_shard",
        }
    }
}

/// Why a committed command did not change the state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandRejection {
    MembershipConflict { raft_name: String, existing: String },
    UnknownServer(String),
    NoServers,
    ShardNotFound(ShardId),
    WouldOrphanShard { server_id: ServerId, shard_id: ShardId },
    InvalidShard(String),
}

impl From<CommandRejection> for Error {
    fn from(rejection: CommandRejection) -> Self {
        match rejection {
            CommandRejection::MembershipConflict {
                raft_name,
                existing,
            } => Error::MembershipConflict {
                raft_name,
                existing,
            },
            CommandRejection::UnknownServer(name) => Error::UnknownServer(name),
            CommandRejection::NoServers => Error::NoServers,
            CommandRejection::ShardNotFound(id) => Error::ShardNotFound(id),
            CommandRejection::WouldOrphanShard {
                server_id,
                shard_id,
            } => Error::Rejected(format!(
                "removing {} would leave shard {} without owners",
                server_id, shard_id
            )),
            CommandRejection::InvalidShard(reason) => Error::Rejected(reason),
        }
    }
}

/// Result of applying a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandResponse {
    Ok,
    ServerRegistered(ServerId),
    AddressCorrected(ServerId),
    ServerRemoved(ServerId),
    /// `created` is false when a shard with the exact range already existed
    ShardCreated { shard_id: ShardId, created: bool },
    ShardOwnersUpdated(ShardId),
    ShardDropped(ShardId),
    Rejected(CommandRejection),
}

impl CommandResponse {
    pub fn into_result(self) -> crate::Result<CommandResponse> {
        match self {
            CommandResponse::Rejected(rejection) => Err(rejection.into()),
            other => Ok(other),
        }
    }
}

/// Side effects a node may need to act on after a command applies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    ServerUpserted(ClusterServer),
    ServerRemoved(ServerId),
    ShardCreated(Shard),
    ShardOwnersChanged { before: Shard, after: Shard },
    ShardDropped(Shard),
}

impl ClusterState {
    /// Apply a committed command at consensus log `index`.
    ///
    /// Pure and deterministic: the same command sequence produces the same state on
    /// every node. Rejections leave the state untouched apart from `applied_index`.
    pub fn apply(&mut self, index: u64, command: &ClusterCommand) -> (CommandResponse, Vec<ClusterEvent>) {
        self.applied_index = self.applied_index.max(index);
        let mut events = Vec::new();

        let response = match command {
            ClusterCommand::Noop => CommandResponse::Ok,
            ClusterCommand::RegisterServer {
                raft_name,
                connection,
                role,
            } => self.register_server(raft_name, connection, *role, &mut events),
            ClusterCommand::CorrectAddress {
                raft_name,
                connection,
            } => self.correct_address(raft_name, connection, &mut events),
            ClusterCommand::RemoveServer { server_id } => {
                self.remove_server(*server_id, &mut events)
            }
            ClusterCommand::CreateShard { definition } => {
                self.create_shard(definition, &mut events)
            }
            ClusterCommand::UpdateShardOwners { shard_id, owners } => {
                self.update_shard_owners(*shard_id, owners, &mut events)
            }
            ClusterCommand::DropShard { shard_id } => match self.shards.remove(shard_id) {
                Some(shard) => {
                    events.push(ClusterEvent::ShardDropped(shard));
                    CommandResponse::ShardDropped(*shard_id)
                }
                None => CommandResponse::Rejected(CommandRejection::ShardNotFound(*shard_id)),
            },
        };

        (response, events)
    }

    fn register_server(
        &mut self,
        raft_name: &str,
        connection: &ConnectionInfo,
        role: ServerRole,
        events: &mut Vec<ClusterEvent>,
    ) -> CommandResponse {
        if let Some(existing) = self.server_by_name(raft_name) {
            if existing.connection == *connection {
                return CommandResponse::ServerRegistered(existing.id);
            }
            return CommandResponse::Rejected(CommandRejection::MembershipConflict {
                raft_name: raft_name.to_string(),
                existing: existing.connection.to_string(),
            });
        }

        self.next_server_id = self.next_server_id.max(1);
        let id = ServerId(self.next_server_id);
        self.next_server_id += 1;
        let server = ClusterServer {
            id,
            raft_name: raft_name.to_string(),
            connection: connection.clone(),
            role,
        };
        self.servers.insert(id, server.clone());
        events.push(ClusterEvent::ServerUpserted(server));
        CommandResponse::ServerRegistered(id)
    }

    fn correct_address(
        &mut self,
        raft_name: &str,
        connection: &ConnectionInfo,
        events: &mut Vec<ClusterEvent>,
    ) -> CommandResponse {
        let Some(server) = self.servers.values_mut().find(|s| s.raft_name == raft_name) else {
            return CommandResponse::Rejected(CommandRejection::UnknownServer(
                raft_name.to_string(),
            ));
        };
        if server.connection != *connection {
            server.connection = connection.clone();
            events.push(ClusterEvent::ServerUpserted(server.clone()));
        }
        CommandResponse::AddressCorrected(server.id)
    }

    fn remove_server(
        &mut self,
        server_id: ServerId,
        events: &mut Vec<ClusterEvent>,
    ) -> CommandResponse {
        if !self.servers.contains_key(&server_id) {
            return CommandResponse::Rejected(CommandRejection::UnknownServer(
                server_id.to_string(),
            ));
        }
        if let Some(shard) = self
            .shards
            .values()
            .find(|s| s.owners.len() == 1 && s.owners[0] == server_id)
        {
            return CommandResponse::Rejected(CommandRejection::WouldOrphanShard {
                server_id,
                shard_id: shard.id,
            });
        }

        self.servers.remove(&server_id);
        for shard in self.shards.values_mut() {
            if shard.is_local(server_id) {
                let before = shard.clone();
                shard.owners.retain(|o| *o != server_id);
                events.push(ClusterEvent::ShardOwnersChanged {
                    before,
                    after: shard.clone(),
                });
            }
        }
        events.push(ClusterEvent::ServerRemoved(server_id));
        CommandResponse::ServerRemoved(server_id)
    }

    fn create_shard(
        &mut self,
        definition: &ShardDefinition,
        events: &mut Vec<ClusterEvent>,
    ) -> CommandResponse {
        if definition.start_time >= definition.end_time {
            return CommandResponse::Rejected(CommandRejection::InvalidShard(format!(
                "empty shard range [{}, {})",
                definition.start_time, definition.end_time
            )));
        }
        if let Some(existing) = self.shards.values().find(|s| {
            s.start_time == definition.start_time && s.end_time == definition.end_time
        }) {
            return CommandResponse::ShardCreated {
                shard_id: existing.id,
                created: false,
            };
        }
        if self.servers.is_empty() {
            return CommandResponse::Rejected(CommandRejection::NoServers);
        }

        self.next_shard_id = self.next_shard_id.max(1);
        let id = self.next_shard_id;
        self.next_shard_id += 1;

        let names: Vec<String> = self.servers.keys().map(|id| id.0.to_string()).collect();
        let wanted = definition.replication_factor.max(1);
        let owners: Vec<ServerId> =
            select_replicas(&format!("shard-{}", definition.start_time), &names, wanted)
                .iter()
                .filter_map(|name| name.parse::<u32>().ok())
                .map(ServerId)
                .collect();

        let shard = Shard {
            id,
            start_time: definition.start_time,
            end_time: definition.end_time,
            owners,
        };
        self.shards.insert(id, shard.clone());
        events.push(ClusterEvent::ShardCreated(shard));
        CommandResponse::ShardCreated {
            shard_id: id,
            created: true,
        }
    }

    fn update_shard_owners(
        &mut self,
        shard_id: ShardId,
        owners: &[ServerId],
        events: &mut Vec<ClusterEvent>,
    ) -> CommandResponse {
        let mut deduped: Vec<ServerId> = Vec::with_capacity(owners.len());
        for owner in owners {
            if !deduped.contains(owner) {
                deduped.push(*owner);
            }
        }
        if deduped.is_empty() {
            return CommandResponse::Rejected(CommandRejection::InvalidShard(format!(
                "shard {} needs at least one owner",
                shard_id
            )));
        }
        if let Some(unknown) = deduped.iter().find(|o| !self.servers.contains_key(*o)) {
            return CommandResponse::Rejected(CommandRejection::UnknownServer(unknown.to_string()));
        }
        let Some(shard) = self.shards.get_mut(&shard_id) else {
            return CommandResponse::Rejected(CommandRejection::ShardNotFound(shard_id));
        };

        let before = shard.clone();
        shard.owners = deduped;
        events.push(ClusterEvent::ShardOwnersChanged {
            before,
            after: shard.clone(),
        });
        CommandResponse::ShardOwnersUpdated(shard_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(name: &str) -> ClusterCommand {
        ClusterCommand::RegisterServer {
            raft_name: name.to_string(),
            connection: ConnectionInfo::new(
                format!("http://{}:8090", name),
                format!("http://{}:8099", name),
            ),
            role: ServerRole::Voter,
        }
    }

    fn create(start: i64, rf: usize) -> ClusterCommand {
        ClusterCommand::CreateShard {
            definition: ShardDefinition {
                start_time: start,
                end_time: start + 1000,
                replication_factor: rf,
            },
        }
    }

    fn apply_all(commands: &[ClusterCommand]) -> (ClusterState, Vec<CommandResponse>) {
        let mut state = ClusterState::default();
        let responses = commands
            .iter()
            .enumerate()
            .map(|(i, c)| state.apply(i as u64 + 1, c).0)
            .collect();
        (state, responses)
    }

    #[test]
    fn test_identical_commands_give_identical_state() {
        let commands = vec![
            register("a"),
            register("b"),
            register("c"),
            create(0, 2),
            create(1000, 2),
            ClusterCommand::Noop,
            create(0, 2),
        ];
        let (first, _) = apply_all(&commands);
        let (second, _) = apply_all(&commands);
        assert_eq!(first, second);
        assert_eq!(first.encode().unwrap(), second.encode().unwrap());
        assert_eq!(first.applied_index, 7);
    }

    #[test]
    fn test_register_is_idempotent_and_detects_conflicts() {
        let conflicting = ClusterCommand::RegisterServer {
            raft_name: "a".into(),
            connection: ConnectionInfo::new("http://elsewhere:1", "http://elsewhere:2"),
            role: ServerRole::Voter,
        };
        let (state, responses) = apply_all(&[register("a"), register("a"), conflicting]);
        assert_eq!(state.servers.len(), 1);
        assert_eq!(responses[0], CommandResponse::ServerRegistered(ServerId(1)));
        assert_eq!(responses[1], CommandResponse::ServerRegistered(ServerId(1)));
        assert!(matches!(
            responses[2],
            CommandResponse::Rejected(CommandRejection::MembershipConflict { .. })
        ));
    }

    #[test]
    fn test_correct_address_updates_in_place() {
        let correct = ClusterCommand::CorrectAddress {
            raft_name: "a".into(),
            connection: ConnectionInfo::new("http://new:1", "http://new:2"),
        };
        let (state, responses) = apply_all(&[register("a"), register("b"), correct]);
        assert_eq!(state.servers.len(), 2);
        assert_eq!(responses[2], CommandResponse::AddressCorrected(ServerId(1)));
        let a = state.server(ServerId(1)).unwrap();
        assert_eq!(a.raft_name, "a");
        assert_eq!(a.connection.raft_connection_string, "http://new:1");

        let (_, responses) = apply_all(&[ClusterCommand::CorrectAddress {
            raft_name: "ghost".into(),
            connection: ConnectionInfo::new("x", "y"),
        }]);
        assert!(matches!(
            responses[0],
            CommandResponse::Rejected(CommandRejection::UnknownServer(_))
        ));
    }

    #[test]
    fn test_shard_creation_needs_servers_and_assigns_owners() {
        let (state, responses) = apply_all(&[create(0, 1)]);
        assert_eq!(
            responses[0],
            CommandResponse::Rejected(CommandRejection::NoServers)
        );
        assert!(state.shards.is_empty());

        let (state, responses) = apply_all(&[register("a"), register("b"), create(0, 5), create(0, 1)]);
        let shard = state.shard(1).unwrap();
        // replication factor is capped by the number of servers
        assert_eq!(shard.owners.len(), 2);
        assert_eq!(
            responses[3],
            CommandResponse::ShardCreated {
                shard_id: 1,
                created: false
            }
        );
        for shard in state.shards.values() {
            assert!(!shard.owners.is_empty());
        }
    }

    #[test]
    fn test_remove_server_never_orphans_a_shard() {
        let (mut state, _) = apply_all(&[register("a"), create(0, 1)]);
        let (response, _) = state.apply(3, &ClusterCommand::RemoveServer { server_id: ServerId(1) });
        assert!(matches!(
            response,
            CommandResponse::Rejected(CommandRejection::WouldOrphanShard { .. })
        ));
        assert_eq!(state.servers.len(), 1);

        let (mut state, _) = apply_all(&[register("a"), register("b"), create(0, 2)]);
        let (response, events) =
            state.apply(4, &ClusterCommand::RemoveServer { server_id: ServerId(2) });
        assert_eq!(response, CommandResponse::ServerRemoved(ServerId(2)));
        assert_eq!(state.shard(1).unwrap().owners, vec![ServerId(1)]);
        assert!(events.contains(&ClusterEvent::ServerRemoved(ServerId(2))));
    }

    #[test]
    fn test_update_owners_validates() {
        let (mut state, _) = apply_all(&[register("a"), register("b"), create(0, 1)]);
        let (response, _) = state.apply(
            4,
            &ClusterCommand::UpdateShardOwners {
                shard_id: 1,
                owners: vec![],
            },
        );
        assert!(matches!(response, CommandResponse::Rejected(_)));

        let (response, _) = state.apply(
            5,
            &ClusterCommand::UpdateShardOwners {
                shard_id: 1,
                owners: vec![ServerId(9)],
            },
        );
        assert!(matches!(
            response,
            CommandResponse::Rejected(CommandRejection::UnknownServer(_))
        ));

        let (response, _) = state.apply(
            6,
            &ClusterCommand::UpdateShardOwners {
                shard_id: 1,
                owners: vec![ServerId(2), ServerId(1), ServerId(2)],
            },
        );
        assert_eq!(response, CommandResponse::ShardOwnersUpdated(1));
        assert_eq!(state.shard(1).unwrap().owners, vec![ServerId(2), ServerId(1)]);
    }

    #[test]
    fn test_drop_shard() {
        let (mut state, _) = apply_all(&[register("a"), create(0, 1)]);
        let (response, events) = state.apply(3, &ClusterCommand::DropShard { shard_id: 1 });
        assert_eq!(response, CommandResponse::ShardDropped(1));
        assert!(matches!(events[0], ClusterEvent::ShardDropped(_)));
        assert!(state.shards.is_empty());

        let (response, _) = state.apply(4, &ClusterCommand::DropShard { shard_id: 1 });
        assert_eq!(
            response,
            CommandResponse::Rejected(CommandRejection::ShardNotFound(1))
        );
    }
}
