//! The three sender state machines, unified behind a single `tick()` entry
//! point returning a tagged-variant `Action`. Pre-file queues an intro
//! buffer, unthrottled drains as fast as the socket accepts, throttled paces
//! reads to the advertised bitrate.

use std::sync::Arc;

use crate::format::FormatReadOutcome;
use crate::handle::FileHandle;
use crate::listener::{Action, IntroBuffer, Listener, SenderState};
use crate::worker::WorkerPool;

/// Pre-file buffer budget: stop queuing once either limit
/// is hit and fall through to the appropriate body sender.
const PREFILE_MAX_BUFFERS: usize = 8;
const PREFILE_MAX_BYTES: usize = 30 * 1024;

/// Unthrottled read budget per tick.
const UNTHROTTLED_MAX_READS: usize = 6;
const UNTHROTTLED_MAX_BYTES: usize = 48 * 1024;

/// EAGAIN backoff schedule for the unthrottled sender.
const EAGAIN_FIRST_BACKOFF_MS: i64 = 80;
const EAGAIN_REPEAT_BACKOFF_MS: i64 = 150;
const EAGAIN_SHORT_BACKOFF_MS: i64 = 4;

/// Initial bolus handed to a fresh throttled listener before rate pacing
/// kicks in.
const THROTTLED_INITIAL_BOLUS: u64 = 8 * 1024;
/// FLV streams get a 1% allowance above the nominal rate to absorb
/// keyframe bursts.
const FLV_RATE_INFLATION: f64 = 1.01;

/// What the caller should do with the bytes a sender produced. Actually
/// writing to the socket is the HTTP layer's job; this module only decides
/// what to send and when to call back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    WouldBlock,
    Wrote(usize),
    ConnectionClosed,
}

/// Collaborator the sender drives to actually push bytes to a socket. The
/// HTTP/connection layer implements this; out of scope here.
pub trait Socket {
    fn write(&mut self, buf: &[u8]) -> WriteOutcome;
}

fn queue_intro(listener: &mut Listener, fh: &Arc<FileHandle>) {
    let st = fh.state.lock();
    if let Some(format) = &st.format {
        let header = format.create_client_data();
        if !header.is_empty() {
            listener.refbufs.push_back(IntroBuffer {
                data: header,
                is_header: true,
            });
        }
    }
    listener.intro_offset = st.frame_start_pos;
}

/// Drain queued intro buffers, honoring `PREFILE_MAX_BUFFERS`/`_BYTES`.
/// Falls through to the appropriate body sender once the queue empties or
/// a budget is exhausted.
fn tick_prefile(listener: &mut Listener, socket: &mut dyn Socket, throttled: bool) -> Action {
    let mut sent_bytes = 0usize;
    let mut sent_buffers = 0usize;

    while sent_buffers < PREFILE_MAX_BUFFERS && sent_bytes < PREFILE_MAX_BYTES {
        let Some(front) = listener.refbufs.front() else {
            listener.ops = if throttled {
                SenderState::Throttled
            } else {
                SenderState::Unthrottled
            };
            return Action::Continue;
        };

        match socket.write(&front.data[listener.pos..]) {
            WriteOutcome::Wrote(n) => {
                listener.pos += n;
                sent_bytes += n;
                if listener.pos >= front.data.len() {
                    listener.refbufs.pop_front();
                    listener.pos = 0;
                    sent_buffers += 1;
                }
            }
            WriteOutcome::WouldBlock => return Action::RescheduleIn(EAGAIN_SHORT_BACKOFF_MS),
            WriteOutcome::ConnectionClosed => return Action::Terminate,
        }
    }

    if listener.refbufs.is_empty() {
        listener.ops = if throttled {
            SenderState::Throttled
        } else {
            SenderState::Unthrottled
        };
    }
    Action::Continue
}

/// Drains the file body as fast as the socket accepts, bounded to
/// `UNTHROTTLED_MAX_READS`/`_BYTES` per tick so one listener can't starve
/// the worker.
fn tick_unthrottled(listener: &mut Listener, fh: &Arc<FileHandle>, socket: &mut dyn Socket) -> Action {
    let mut reads = 0usize;
    let mut bytes = 0usize;
    let mut eagain_streak = 0u32;

    while reads < UNTHROTTLED_MAX_READS && bytes < UNTHROTTLED_MAX_BYTES {
        let mut buf = Vec::new();
        let outcome = {
            let st = fh.state.lock();
            let Some(file) = &st.file else {
                return Action::Terminate;
            };
            let format = st.format.as_ref().expect("materialized FH always has a format");
            format.read_frame(file, listener.intro_offset, &mut buf)
        };

        match outcome {
            FormatReadOutcome::Filled(n) => {
                listener.intro_offset += n as u64;
                match socket.write(&buf) {
                    WriteOutcome::Wrote(_) => {
                        reads += 1;
                        bytes += n;
                    }
                    WriteOutcome::WouldBlock => {
                        eagain_streak += 1;
                        let delay = if eagain_streak == 1 {
                            EAGAIN_FIRST_BACKOFF_MS
                        } else {
                            EAGAIN_REPEAT_BACKOFF_MS
                        };
                        return Action::RescheduleIn(delay);
                    }
                    WriteOutcome::ConnectionClosed => return Action::Terminate,
                }
            }
            FormatReadOutcome::Eof => {
                let st = fh.state.lock();
                if st.binding.is_fallback() {
                    listener.intro_offset = st.frame_start_pos;
                    return Action::RescheduleIn(EAGAIN_SHORT_BACKOFF_MS);
                }
                return Action::Terminate;
            }
            FormatReadOutcome::Fatal => return Action::Terminate,
        }
    }
    Action::Continue
}

/// Paces reads to the binding's bitrate limit: a fresh
/// listener gets an initial bolus, after which bytes sent are compared
/// against the elapsed window to decide how long to sleep before the next
/// read.
fn tick_throttled(listener: &mut Listener, fh: &Arc<FileHandle>, socket: &mut dyn Socket, now_ms: i64) -> Action {
    if listener.timer_start == 0 {
        listener.timer_start = now_ms;
        listener.counter = 0;
    }

    let (limit, is_flv) = {
        let st = fh.state.lock();
        (st.binding.limit, listener.flags.contains(crate::listener::ListenerFlags::WANTS_FLV))
    };
    if limit == 0 {
        return tick_unthrottled(listener, fh, socket);
    }
    let effective_limit = if is_flv {
        (limit as f64 * FLV_RATE_INFLATION) as u64
    } else {
        limit
    };

    let elapsed_ms = (now_ms - listener.timer_start).max(0) as u64;
    let budget = if listener.counter == 0 {
        THROTTLED_INITIAL_BOLUS
    } else {
        (effective_limit * elapsed_ms) / 1000
    };

    if listener.counter >= budget {
        let owed_ms = ((listener.counter * 1000) / effective_limit.max(1)) as i64 - elapsed_ms as i64;
        return Action::RescheduleIn(owed_ms.max(1));
    }

    let mut buf = Vec::new();
    let outcome = {
        let st = fh.state.lock();
        let Some(file) = &st.file else {
            return Action::Terminate;
        };
        let format = st.format.as_ref().expect("materialized FH always has a format");
        format.read_frame(file, listener.intro_offset, &mut buf)
    };

    match outcome {
        FormatReadOutcome::Filled(n) => {
            listener.intro_offset += n as u64;
            match socket.write(&buf) {
                WriteOutcome::Wrote(_) => {
                    listener.counter += n as u64;
                    let mut rate = fh.state.lock();
                    rate.out_bitrate.add(n as u64, now_ms);
                    Action::Continue
                }
                WriteOutcome::WouldBlock => Action::RescheduleIn(EAGAIN_SHORT_BACKOFF_MS),
                WriteOutcome::ConnectionClosed => Action::Terminate,
            }
        }
        FormatReadOutcome::Eof => {
            let st = fh.state.lock();
            if st.binding.is_fallback() {
                listener.intro_offset = st.frame_start_pos;
                drop(st);
                listener.timer_start = 0;
                Action::RescheduleIn(EAGAIN_SHORT_BACKOFF_MS)
            } else {
                Action::Terminate
            }
        }
        FormatReadOutcome::Fatal => Action::Terminate,
    }
}

/// Single entry point the worker loop calls every time a listener is due
///. Dispatches on `listener.ops`, calls into `WorkerPool` for
/// the throttled sender's opportunistic rebalancing, and surfaces
/// migration when an override has landed underneath this listener.
pub fn tick(
    listener: &mut Listener,
    fh: &Arc<FileHandle>,
    socket: &mut dyn Socket,
    workers: &WorkerPool,
    now_ms: i64,
) -> Action {
    if listener.error {
        return Action::Terminate;
    }

    if listener.is_authenticated() {
        let st = fh.state.lock();
        if let Some(dest) = &st.binding.override_mount {
            let mut binding = st.binding.clone();
            binding.override_mount = None;
            binding.mount = dest.clone();
            drop(st);
            // The new attachment needs to pick up mid-buffer if this
            // listener's current refbuf still has pending bytes.
            let pending = listener
                .refbufs
                .front()
                .is_some_and(|front| listener.pos < front.data.len());
            if pending {
                listener.flags |= crate::listener::ListenerFlags::HAS_INTRO_CONTENT;
            }
            return Action::Migrate(binding);
        }
    }

    let action = match listener.ops {
        SenderState::PreFile => {
            let throttled = fh.state.lock().binding.limit > 0;
            if listener.refbufs.is_empty() {
                queue_intro(listener, fh);
            }
            tick_prefile(listener, socket, throttled)
        }
        SenderState::Unthrottled => tick_unthrottled(listener, fh, socket),
        SenderState::Throttled => tick_throttled(listener, fh, socket, now_ms),
    };

    if matches!(listener.ops, SenderState::Throttled) {
        if let Some(worker_id) = listener.worker_id.map(crate::worker::WorkerId) {
            if let Some(new_worker) = workers.try_rebalance(worker_id) {
                listener.worker_id = Some(new_worker.0);
            }
        }
    }

    action
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::FileBinding;
    use crate::listener::ListenerId;
    use crate::pread::PositionalFile;
    use std::io::Write;
    use tempfile::TempDir;

    struct FakeSocket {
        written: Vec<u8>,
        block_after: Option<usize>,
        calls: usize,
    }

    impl FakeSocket {
        fn unbounded() -> Self {
            FakeSocket {
                written: Vec::new(),
                block_after: None,
                calls: 0,
            }
        }
    }

    impl Socket for FakeSocket {
        fn write(&mut self, buf: &[u8]) -> WriteOutcome {
            self.calls += 1;
            if let Some(limit) = self.block_after {
                if self.calls > limit {
                    return WriteOutcome::WouldBlock;
                }
            }
            self.written.extend_from_slice(buf);
            WriteOutcome::Wrote(buf.len())
        }
    }

    fn make_fh(dir: &TempDir, name: &str, content: &[u8], limit: u64) -> Arc<FileHandle> {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content).unwrap();
        let mut binding = FileBinding::new(format!("/{name}"));
        binding.limit = limit;
        let fh = FileHandle::new(binding);
        let mut st = fh.state.lock();
        st.file = Some(Arc::new(PositionalFile::open(&path).unwrap()));
        st.format = Some(Arc::new(crate::format::GenericFormat::new("audio/mpeg")));
        drop(st);
        fh
    }

    #[test]
    fn prefile_with_empty_queue_falls_through_to_unthrottled() {
        let dir = TempDir::new().unwrap();
        let fh = make_fh(&dir, "a.mp3", b"0123456789", 0);
        let mut listener = Listener::new(ListenerId(1));
        let mut socket = FakeSocket::unbounded();
        let workers = WorkerPool::new(1);
        let action = tick(&mut listener, &fh, &mut socket, &workers, 0);
        assert_eq!(listener.ops, SenderState::Unthrottled);
        assert_eq!(action, Action::Continue);
    }

    #[test]
    fn unthrottled_reads_to_eof_and_terminates_plain_file() {
        let dir = TempDir::new().unwrap();
        let fh = make_fh(&dir, "a.mp3", b"0123456789", 0);
        let mut listener = Listener::new(ListenerId(1));
        listener.ops = SenderState::Unthrottled;
        let mut socket = FakeSocket::unbounded();
        let workers = WorkerPool::new(1);
        let mut action = Action::Continue;
        for _ in 0..3 {
            action = tick(&mut listener, &fh, &mut socket, &workers, 0);
            if action == Action::Terminate {
                break;
            }
        }
        assert_eq!(action, Action::Terminate);
        assert_eq!(socket.written, b"0123456789");
    }

    #[test]
    fn unthrottled_eof_on_fallback_rewinds_instead_of_terminating() {
        let dir = TempDir::new().unwrap();
        let fh = make_fh(&dir, "a.mp3", b"abc", 0);
        fh.state.lock().binding.flags |= crate::binding::BindingFlags::FALLBACK;
        let mut listener = Listener::new(ListenerId(1));
        listener.ops = SenderState::Unthrottled;
        listener.intro_offset = 3; // already at EOF
        let mut socket = FakeSocket::unbounded();
        let workers = WorkerPool::new(1);
        let action = tick(&mut listener, &fh, &mut socket, &workers, 0);
        assert!(matches!(action, Action::RescheduleIn(_)));
        assert_eq!(listener.intro_offset, 0);
    }

    #[test]
    fn would_block_reschedules_with_first_backoff() {
        let dir = TempDir::new().unwrap();
        let fh = make_fh(&dir, "a.mp3", b"0123456789", 0);
        let mut listener = Listener::new(ListenerId(1));
        listener.ops = SenderState::Unthrottled;
        let mut socket = FakeSocket::unbounded();
        socket.block_after = Some(0);
        let workers = WorkerPool::new(1);
        let action = tick(&mut listener, &fh, &mut socket, &workers, 0);
        assert_eq!(action, Action::RescheduleIn(EAGAIN_FIRST_BACKOFF_MS));
    }

    #[test]
    fn throttled_grants_initial_bolus_then_paces() {
        let dir = TempDir::new().unwrap();
        let fh = make_fh(&dir, "a.mp3", &[0u8; 20_000], 8000);
        let mut listener = Listener::new(ListenerId(1));
        listener.ops = SenderState::Throttled;
        let mut socket = FakeSocket::unbounded();
        let workers = WorkerPool::new(1);
        let action = tick(&mut listener, &fh, &mut socket, &workers, 0);
        assert_eq!(action, Action::Continue);
        assert!(listener.counter > 0);
        assert!(listener.counter <= THROTTLED_INITIAL_BOLUS);
    }

    #[test]
    fn migration_surfaces_when_override_is_pending() {
        let dir = TempDir::new().unwrap();
        let fh = make_fh(&dir, "a.mp3", b"abc", 0);
        fh.state.lock().binding.override_mount = Some("/b.mp3".to_string());
        let mut listener = Listener::new(ListenerId(1));
        listener.flags |= crate::listener::ListenerFlags::AUTHENTICATED;
        let mut socket = FakeSocket::unbounded();
        let workers = WorkerPool::new(1);
        let action = tick(&mut listener, &fh, &mut socket, &workers, 0);
        match action {
            Action::Migrate(binding) => assert_eq!(binding.mount, "/b.mp3"),
            other => panic!("expected Migrate, got {other:?}"),
        }
    }

    #[test]
    fn unauthenticated_listener_does_not_migrate_on_override() {
        let dir = TempDir::new().unwrap();
        let fh = make_fh(&dir, "a.mp3", b"abc", 0);
        fh.state.lock().binding.override_mount = Some("/b.mp3".to_string());
        let mut listener = Listener::new(ListenerId(1));
        let mut socket = FakeSocket::unbounded();
        let workers = WorkerPool::new(1);
        let action = tick(&mut listener, &fh, &mut socket, &workers, 0);
        assert!(!matches!(action, Action::Migrate(_)));
    }

    #[test]
    fn migrating_with_pending_refbuf_bytes_marks_has_intro_content() {
        let dir = TempDir::new().unwrap();
        let fh = make_fh(&dir, "a.mp3", b"abc", 0);
        fh.state.lock().binding.override_mount = Some("/b.mp3".to_string());
        let mut listener = Listener::new(ListenerId(1));
        listener.flags |= crate::listener::ListenerFlags::AUTHENTICATED;
        listener.refbufs.push_back(IntroBuffer {
            data: b"unsent header bytes".to_vec(),
            is_header: true,
        });
        let mut socket = FakeSocket::unbounded();
        let workers = WorkerPool::new(1);
        let action = tick(&mut listener, &fh, &mut socket, &workers, 0);
        assert!(matches!(action, Action::Migrate(_)));
        assert!(listener.flags.contains(crate::listener::ListenerFlags::HAS_INTRO_CONTENT));
    }

    #[test]
    fn listener_error_terminates_immediately() {
        let dir = TempDir::new().unwrap();
        let fh = make_fh(&dir, "a.mp3", b"abc", 0);
        let mut listener = Listener::new(ListenerId(1));
        listener.error = true;
        let mut socket = FakeSocket::unbounded();
        let workers = WorkerPool::new(1);
        assert_eq!(tick(&mut listener, &fh, &mut socket, &workers, 0), Action::Terminate);
    }
}
