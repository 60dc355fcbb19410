use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::channel::MessageChannel;
use crate::events::{OutboundMessage, ReplayEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

#[derive(Default)]
struct ScrollState {
    last_y: Option<f64>,
    direction: Option<Direction>,
    pending: Option<ReplayEvent>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<ScrollState>,
    channel: Arc<dyn MessageChannel>,
    active: Arc<AtomicBool>,
}

impl Shared {
    fn forward(&self, event: ReplayEvent) {
        // Re-checked here: a flush can race with stop.
        if !self.active.load(Ordering::SeqCst) {
            trace!("recorder inactive, dropping scroll event");
            return;
        }
        if let Err(e) = self.channel.send(OutboundMessage::RrwebEvent(event)) {
            warn!("Failed to send scroll event: {}", e);
        }
    }
}

/// Debounces replay-engine scroll events.
///
/// Scrolls in one direction collapse into the most recent one, emitted after a quiet
/// period. A direction reversal flushes the buffered scroll at once so the turning
/// point survives.
pub struct ScrollSmoother {
    shared: Arc<Shared>,
    runtime: Handle,
    quiet_period: Duration,
}

impl ScrollSmoother {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        active: Arc<AtomicBool>,
        runtime: Handle,
        quiet_period: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ScrollState::default()),
                channel,
                active,
            }),
            runtime,
            quiet_period,
        }
    }

    /// Buffer a scroll event. Non-scroll events are ignored.
    pub fn push(&self, mut event: ReplayEvent) {
        event.round_scroll_coordinates();
        let Some((_, y)) = event.scroll_position() else {
            return;
        };

        let flushed = {
            let Ok(mut state) = self.shared.state.lock() else {
                return;
            };

            let direction = match state.last_y {
                Some(last) if y > last => Some(Direction::Down),
                Some(last) if y < last => Some(Direction::Up),
                _ => state.direction,
            };
            state.last_y = Some(y);

            let reversed = matches!(
                (state.direction, direction),
                (Some(previous), Some(current)) if previous != current
            );
            let flushed = if reversed {
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
                trace!(y, "scroll direction reversed, flushing");
                state.pending.take()
            } else {
                None
            };

            state.direction = direction;
            state.pending = Some(event);
            state.generation += 1;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.timer = Some(self.arm(state.generation));
            flushed
        };

        if let Some(event) = flushed {
            self.shared.forward(event);
        }
    }

    fn arm(&self, generation: u64) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let quiet_period = self.quiet_period;
        self.runtime.spawn(async move {
            tokio::time::sleep(quiet_period).await;
            let event = {
                let Ok(mut state) = shared.state.lock() else {
                    return;
                };
                // Superseded by a later scroll.
                if state.generation != generation {
                    return;
                }
                state.timer = None;
                state.direction = None;
                state.pending.take()
            };
            if let Some(event) = event {
                shared.forward(event);
            }
        })
    }

    /// Whether a scroll is waiting for the quiet period to elapse.
    pub fn has_pending(&self) -> bool {
        self.shared
            .state
            .lock()
            .map(|s| s.pending.is_some())
            .unwrap_or(false)
    }

    /// Cancel the timer and drop anything buffered.
    pub fn shutdown(&self) {
        if let Ok(mut state) = self.shared.state.lock() {
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            if state.pending.take().is_some() {
                trace!("discarded buffered scroll event");
            }
            state.direction = None;
            state.last_y = None;
            state.generation += 1;
        }
    }
}

impl Drop for ScrollSmoother {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LocalChannel;
    use tokio::sync::broadcast;

    fn smoother() -> (ScrollSmoother, broadcast::Receiver<OutboundMessage>) {
        let channel = Arc::new(LocalChannel::default());
        let rx = channel.subscribe();
        let smoother = ScrollSmoother::new(
            channel,
            Arc::new(AtomicBool::new(true)),
            Handle::current(),
            Duration::from_millis(150),
        );
        (smoother, rx)
    }

    fn scrolled_y(message: OutboundMessage) -> f64 {
        match message {
            OutboundMessage::RrwebEvent(event) => event.scroll_position().unwrap().1,
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_direction_coalesces_to_latest() {
        let (smoother, mut rx) = smoother();
        smoother.push(ReplayEvent::scroll(1, 0.0, 100.0, 1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        smoother.push(ReplayEvent::scroll(1, 0.0, 200.4, 2));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err(), "timer was re-armed");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(scrolled_y(rx.try_recv().unwrap()), 200.0);
        assert!(rx.try_recv().is_err());
        assert!(!smoother.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reversal_flushes_pre_reversal_event() {
        let (smoother, mut rx) = smoother();
        smoother.push(ReplayEvent::scroll(1, 0.0, 100.0, 1));
        smoother.push(ReplayEvent::scroll(1, 0.0, 300.0, 2));
        smoother.push(ReplayEvent::scroll(1, 0.0, 250.0, 3));

        assert_eq!(scrolled_y(rx.try_recv().unwrap()), 300.0);
        assert!(smoother.has_pending());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(scrolled_y(rx.try_recv().unwrap()), 250.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_discards_pending() {
        let (smoother, mut rx) = smoother();
        smoother.push(ReplayEvent::scroll(1, 0.0, 100.0, 1));
        smoother.shutdown();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_flag_suppresses_flush() {
        let channel = Arc::new(LocalChannel::default());
        let mut rx = channel.subscribe();
        let active = Arc::new(AtomicBool::new(true));
        let smoother = ScrollSmoother::new(
            channel,
            Arc::clone(&active),
            Handle::current(),
            Duration::from_millis(150),
        );
        smoother.push(ReplayEvent::scroll(1, 0.0, 10.0, 1));
        active.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }
}
