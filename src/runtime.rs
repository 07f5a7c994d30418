use crate::connection::{JoinOutcome, JoinResult};
use crate::error::{Result, SyncError};
use crate::protocol::{EnemyId, InputFrame, PeerId, RoomId};
use crate::reconcile::Correction;
use crate::session::{Role, SessionEvent, SessionState};
use crate::snapshot::AvatarPose;
use crate::sync::{HostSimulation, ResumeOutcome, ResumeTarget, SyncManager, SyncStats};
use crate::transport::Signaling;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};

const COMMAND_BUFFER: usize = 64;

type Inspector<S, W> = Box<dyn FnOnce(&mut SyncManager<S, W>) + Send>;

enum Command<S: Signaling, W: HostSimulation> {
    HostGame {
        previous_room_id: Option<RoomId>,
        reply: oneshot::Sender<Result<RoomId>>,
    },
    JoinGame {
        room_id: RoomId,
        reply: oneshot::Sender<JoinOutcome>,
    },
    Resume {
        reply: oneshot::Sender<Result<ResumeOutcome>>,
    },
    JoinerFrame {
        input: InputFrame,
        pose: AvatarPose,
        reply: oneshot::Sender<(AvatarPose, Result<Option<Correction>>)>,
    },
    StartGame {
        reply: oneshot::Sender<Result<()>>,
    },
    ReportEnemyKilled {
        enemy_id: EnemyId,
        reply: oneshot::Sender<Result<()>>,
    },
    KickPlayer {
        peer_id: PeerId,
        reason: String,
        reply: oneshot::Sender<Result<()>>,
    },
    LeaveGame {
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<SyncStatus>,
    },
    Inspect(Inspector<S, W>),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum JoinReply {
    Join(oneshot::Sender<JoinOutcome>),
    Resume(oneshot::Sender<Result<ResumeOutcome>>),
}

struct JoinCompleted<T> {
    result: JoinResult<T>,
    reply: JoinReply,
}

#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub state: SessionState,
    pub role: Option<Role>,
    pub room_id: Option<RoomId>,
    pub local_peer_id: PeerId,
    pub connected_peers: Vec<PeerId>,
    pub running: bool,
    pub stats: SyncStats,
}

/// Handle to a running sync task. Dropping it shuts the task down and
/// disposes the session.
pub struct SyncHandle<S: Signaling, W: HostSimulation> {
    commands: mpsc::Sender<Command<S, W>>,
    task: JoinHandle<()>,
}

impl<S, W> SyncHandle<S, W>
where
    S: Signaling + 'static,
    W: HostSimulation + 'static,
{
    pub fn spawn(manager: SyncManager<S, W>) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run(manager, command_rx, event_tx));

        (Self { commands, task }, event_rx)
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command<S, W>) -> Result<R> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| SyncError::ActorGone)?;
        response.await.map_err(|_| SyncError::ActorGone)
    }

    pub async fn host_game(&self, previous_room_id: Option<RoomId>) -> Result<RoomId> {
        self.request(|reply| Command::HostGame {
            previous_room_id,
            reply,
        })
        .await?
    }

    pub async fn join_game(&self, room_id: RoomId) -> Result<JoinOutcome> {
        self.request(|reply| Command::JoinGame { room_id, reply }).await
    }

    pub async fn resume(&self) -> Result<ResumeOutcome> {
        self.request(|reply| Command::Resume { reply }).await?
    }

    pub async fn joiner_frame(&self, input: InputFrame, pose: &mut AvatarPose) -> Result<Option<Correction>> {
        let (corrected, result) = self
            .request(|reply| Command::JoinerFrame {
                input,
                pose: *pose,
                reply,
            })
            .await?;

        *pose = corrected;
        result
    }

    pub async fn start_game(&self) -> Result<()> {
        self.request(|reply| Command::StartGame { reply }).await?
    }

    pub async fn report_enemy_killed(&self, enemy_id: EnemyId) -> Result<()> {
        self.request(|reply| Command::ReportEnemyKilled { enemy_id, reply })
            .await?
    }

    pub async fn kick_player(&self, peer_id: PeerId, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.request(|reply| Command::KickPlayer {
            peer_id,
            reason,
            reply,
        })
        .await?
    }

    pub async fn leave_game(&self) -> Result<()> {
        self.request(|reply| Command::LeaveGame { reply }).await
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn inspect<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut SyncManager<S, W>) -> R + Send + 'static,
    {
        self.request(|reply| {
            Command::Inspect(Box::new(move |manager: &mut SyncManager<S, W>| {
                let _ = reply.send(f(manager));
            }))
        })
        .await
    }

    pub async fn with_simulation<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut W) -> R + Send + 'static,
    {
        self.inspect(move |manager| f(manager.simulation_mut())).await
    }

    pub async fn shutdown(self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await?;
        self.task.await.map_err(|e| SyncError::Transport(e.to_string()))
    }
}

async fn run<S, W>(
    mut manager: SyncManager<S, W>,
    mut commands: mpsc::Receiver<Command<S, W>>,
    events: mpsc::UnboundedSender<SessionEvent>,
) where
    S: Signaling + 'static,
    W: HostSimulation + 'static,
{
    let mut poll = time::interval(manager.get_config().poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Dropped with the task, which aborts any handshake still in flight.
    let mut joins: JoinSet<JoinCompleted<S::Link>> = JoinSet::new();

    tracing::debug!(peer = %manager.local_peer_id(), "sync task started");

    loop {
        let due = manager.next_broadcast_due();

        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Shutdown { reply }) => {
                    manager.dispose();
                    let _ = reply.send(());
                    break;
                }
                Some(command) => handle_command(&mut manager, &mut joins, command).await,
                None => {
                    manager.dispose();
                    break;
                }
            },
            Some(joined) = joins.join_next(), if !joins.is_empty() => match joined {
                Ok(completed) => finish_join(&mut manager, completed),
                Err(e) => tracing::warn!(error = %e, "join task failed"),
            },
            _ = time::sleep_until(due.unwrap_or_else(Instant::now)), if due.is_some() => {
                manager.host_tick(Instant::now());
            }
            _ = poll.tick() => {
                manager.poll_network(Instant::now());
            }
        }

        for event in manager.take_events() {
            // Nobody listening is fine; the session keeps running.
            let _ = events.send(event);
        }
    }

    tracing::debug!(peer = %manager.local_peer_id(), "sync task stopped");
}

fn start_join<S, W>(
    manager: &mut SyncManager<S, W>,
    joins: &mut JoinSet<JoinCompleted<S::Link>>,
    room_id: RoomId,
    reply: JoinReply,
) where
    S: Signaling + 'static,
    W: HostSimulation + 'static,
{
    let attempt = manager.begin_join(room_id);
    joins.spawn(async move {
        let result = attempt.connect().await;
        JoinCompleted { result, reply }
    });
}

fn finish_join<S, W>(manager: &mut SyncManager<S, W>, completed: JoinCompleted<S::Link>)
where
    S: Signaling + 'static,
    W: HostSimulation + 'static,
{
    let JoinCompleted { result, reply } = completed;
    let room_id = result.room_id().clone();
    let outcome = manager.complete_join(result);

    match reply {
        JoinReply::Join(reply) => {
            let _ = reply.send(outcome);
        }
        JoinReply::Resume(reply) => {
            let _ = reply.send(Ok(ResumeOutcome::from_join(room_id, outcome)));
        }
    }
}

async fn handle_command<S, W>(
    manager: &mut SyncManager<S, W>,
    joins: &mut JoinSet<JoinCompleted<S::Link>>,
    command: Command<S, W>,
) where
    S: Signaling + 'static,
    W: HostSimulation + 'static,
{
    match command {
        Command::HostGame {
            previous_room_id,
            reply,
        } => {
            let _ = reply.send(manager.host_game(previous_room_id).await);
        }
        Command::JoinGame { room_id, reply } => {
            start_join(manager, joins, room_id, JoinReply::Join(reply));
        }
        Command::Resume { reply } => match manager.resume_target() {
            Some(ResumeTarget::Join(room_id)) => {
                tracing::info!(room = %room_id, "rejoining room");
                start_join(manager, joins, room_id, JoinReply::Resume(reply));
            }
            _ => {
                let _ = reply.send(manager.resume().await);
            }
        },
        Command::JoinerFrame { input, mut pose, reply } => {
            let result = manager.joiner_frame(input, &mut pose, Instant::now());
            let _ = reply.send((pose, result));
        }
        Command::StartGame { reply } => {
            let _ = reply.send(manager.start_game(Instant::now()));
        }
        Command::ReportEnemyKilled { enemy_id, reply } => {
            let _ = reply.send(manager.report_enemy_killed(enemy_id, Instant::now()));
        }
        Command::KickPlayer {
            peer_id,
            reason,
            reply,
        } => {
            let _ = reply.send(manager.kick_player(&peer_id, &reason, Instant::now()));
        }
        Command::LeaveGame { reply } => {
            manager.leave_game(Instant::now());
            let _ = reply.send(());
        }
        Command::Status { reply } => {
            let _ = reply.send(SyncStatus {
                state: manager.state(),
                role: manager.role(),
                room_id: manager.room_id().cloned(),
                local_peer_id: manager.local_peer_id().clone(),
                connected_peers: manager.connected_peers(),
                running: manager.is_running(),
                stats: manager.get_stats(),
            });
        }
        Command::Inspect(inspector) => inspector(manager),
        Command::Shutdown { reply } => {
            manager.dispose();
            let _ = reply.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{MemoryIdentityStore, PersistedIdentity};
    use crate::serialization::BinaryFormat;
    use crate::sync::SyncConfig;
    use crate::transport::MemorySignaling;
    use crate::world::SimpleWorld;
    use glam::Vec3;
    use std::time::Duration;

    type Handle = SyncHandle<MemorySignaling, SimpleWorld>;

    fn spawn(signaling: &MemorySignaling, peer: &str) -> (Handle, mpsc::UnboundedReceiver<SessionEvent>) {
        let store = MemoryIdentityStore::with_identity(PersistedIdentity {
            local_peer_id: peer.to_string(),
            hosted_room_id: None,
            joined_room_id: None,
        });
        let manager =
            SyncManager::new(signaling.clone(), SimpleWorld::new(), store, SyncConfig::default()).unwrap();
        SyncHandle::spawn(manager)
    }

    async fn connected() -> (Handle, Handle, mpsc::UnboundedReceiver<SessionEvent>, MemorySignaling) {
        let signaling = MemorySignaling::new(BinaryFormat::MessagePack);
        let (host, host_events) = spawn(&signaling, "host");
        let (joiner, _joiner_events) = spawn(&signaling, "joiner");

        let room = host.host_game(None).await.unwrap();
        let outcome = joiner.join_game(room).await.unwrap();
        assert!(matches!(outcome, JoinOutcome::Connected { .. }));

        (host, joiner, host_events, signaling)
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_through_handles() {
        let (host, joiner, mut host_events, _) = connected().await;
        time::sleep(Duration::from_millis(20)).await;

        let status = host.status().await.unwrap();
        assert_eq!(status.state, SessionState::Connected);
        assert_eq!(status.connected_peers, vec!["joiner".to_string()]);

        assert_eq!(
            host_events.recv().await,
            Some(SessionEvent::PeerConnected {
                peer_id: "joiner".to_string()
            })
        );

        let joiner_status = joiner.status().await.unwrap();
        assert_eq!(joiner_status.role, Some(Role::Joiner));
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_broadcasts_on_its_own() {
        let (host, joiner, _, _) = connected().await;
        time::sleep(Duration::from_millis(200)).await;

        let sent = host.status().await.unwrap().stats.snapshots_sent;
        assert!(sent >= 4, "only {} snapshots sent", sent);

        let sees_host = joiner
            .inspect(|manager| manager.remote().player("host").is_some())
            .await
            .unwrap();
        assert!(sees_host);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_host_sends_nothing() {
        let signaling = MemorySignaling::new(BinaryFormat::MessagePack);
        let (host, _events) = spawn(&signaling, "host");
        host.host_game(None).await.unwrap();

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(host.status().await.unwrap().stats.snapshots_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_idle_link_alive() {
        let (host, joiner, _, _) = connected().await;
        time::sleep(Duration::from_secs(30)).await;

        assert_eq!(host.status().await.unwrap().connected_peers.len(), 1);
        assert_eq!(joiner.status().await.unwrap().state, SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_joiner_frame_applies_host_authority() {
        let (host, joiner, _, _) = connected().await;

        host.with_simulation(|world| {
            world.place_player(&"joiner".to_string(), Vec3::new(2.0, 0.0, 2.0));
        })
        .await
        .unwrap();
        time::sleep(Duration::from_millis(100)).await;

        // Far from the authoritative pose, so the correction snaps.
        let mut pose = AvatarPose::new(Vec3::new(20.0, 0.0, 20.0), 0.0);
        let correction = joiner.joiner_frame(InputFrame::default(), &mut pose).await.unwrap();

        assert_eq!(correction, Some(Correction::Snapped));
        assert!((pose.position - Vec3::new(2.0, 0.0, 2.0)).length() < 0.001);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_game_reaches_joiner() {
        let (host, joiner, _, _) = connected().await;

        host.start_game().await.unwrap();
        time::sleep(Duration::from_millis(20)).await;

        assert!(joiner.status().await.unwrap().running);
        assert!(matches!(joiner.start_game().await, Err(SyncError::NotHost)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_room() {
        let (host, _joiner, mut host_events, signaling) = connected().await;
        let room = host.status().await.unwrap().room_id.unwrap();

        host.shutdown().await.unwrap();
        assert!(!signaling.is_registered(&room).await);

        while host_events.recv().await.is_some() {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_reaches_joiner() {
        let (host, joiner, _, _) = connected().await;

        host.leave_game().await.unwrap();
        time::sleep(Duration::from_millis(20)).await;

        let status = joiner.status().await.unwrap();
        assert_eq!(status.state, SessionState::Disconnected);
        assert_eq!(host.status().await.unwrap().state, SessionState::Left);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_served_while_join_in_flight() {
        let signaling = MemorySignaling::new(BinaryFormat::MessagePack);
        let (joiner, _events) = spawn(&signaling, "joiner");

        // Registered but never accepting, so the handshake runs to its timeout.
        let room = "SILENT".to_string();
        let _incoming = signaling.register(&room).await.unwrap();

        let frame = async {
            time::sleep(Duration::from_millis(10)).await;
            let started = Instant::now();

            let mut pose = AvatarPose::new(Vec3::ZERO, 0.0);
            let correction = joiner.joiner_frame(InputFrame::default(), &mut pose).await.unwrap();
            let state = joiner.status().await.unwrap().state;

            (started.elapsed(), correction, state)
        };

        let (outcome, (waited, correction, state)) = tokio::join!(joiner.join_game(room), frame);

        assert!(waited < Duration::from_millis(100), "frame waited {:?}", waited);
        assert_eq!(correction, None);
        assert_eq!(state, SessionState::Joining);
        assert!(matches!(outcome.unwrap(), JoinOutcome::HostUnavailable { .. }));
        assert_eq!(joiner.status().await.unwrap().state, SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_during_join_supersedes_it() {
        let signaling = MemorySignaling::new(BinaryFormat::MessagePack);
        let (joiner, _events) = spawn(&signaling, "joiner");
        let room = "SILENT".to_string();
        let _incoming = signaling.register(&room).await.unwrap();

        let leave = async {
            time::sleep(Duration::from_millis(10)).await;
            joiner.leave_game().await.unwrap();
        };

        let (outcome, _) = tokio::join!(joiner.join_game(room), leave);

        assert!(matches!(outcome.unwrap(), JoinOutcome::HostUnavailable { .. }));
        assert_eq!(joiner.status().await.unwrap().state, SessionState::Left);
    }
}
