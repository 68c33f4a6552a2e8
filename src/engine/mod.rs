use crate::model::{BladeTarget, DesiredLightState};
use crate::protocol::{self, AuxCommand};
use crate::sync::{SyncCursor, SyncFrame};
use crate::transport::{CommandSink, SendError, SessionGates};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// Distinct color commands inside this window collapse to at most one send.
const COLOR_DEBOUNCE: Duration = Duration::from_millis(100);

/// Where a dispatch request came from. WLED sync bypasses the syncing gate
/// (it must be able to drive the blade while a notification refresh is in
/// flight) but never the authorization gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchSource {
    Local,
    WledSync,
}

/// Last values actually handed to the command channel, per saber. A field
/// is re-sent only when the new value differs or the entry is unset.
#[derive(Debug, Default)]
struct DispatchCache {
    last_on: bool,
    last_brightness: Option<u8>,
    last_color: Option<(u8, u8, u8)>,
    last_color_send: Option<Instant>,
}

/// Converts a desired blade state into the minimal ordered set of wire
/// commands: power, then brightness, then color, each suppressed when the
/// cache already holds the value. Owned by exactly one device task.
pub struct DispatchEngine<S> {
    sink: S,
    gates: SessionGates,
    wled_active: Arc<AtomicBool>,
    cache: DispatchCache,
    cursor: SyncCursor,
}

impl<S: CommandSink> DispatchEngine<S> {
    pub fn new(sink: S, gates: SessionGates, wled_active: Arc<AtomicBool>) -> Self {
        Self {
            sink,
            gates,
            wled_active,
            cache: DispatchCache::default(),
            cursor: SyncCursor::new(),
        }
    }

    /// Entry point for platform-driven state changes.
    pub async fn dispatch_local(&mut self, state: &DesiredLightState) {
        self.dispatch(target_from_platform(state), DispatchSource::Local)
            .await;
    }

    /// Entry point for broadcast sync frames. Only runs while WLED mode is
    /// active for this saber, and never decodes the same generation twice;
    /// an inactive saber does not advance its cursor.
    pub async fn apply_sync_frame(&mut self, frame: &SyncFrame) {
        if !self.wled_active.load(Ordering::SeqCst) {
            return;
        }
        if let Some(target) = self.cursor.take_new(frame) {
            self.dispatch(target, DispatchSource::WledSync).await;
        }
    }

    pub async fn dispatch(&mut self, target: BladeTarget, source: DispatchSource) {
        if !self.accepts(source) {
            return;
        }

        if target.power != self.cache.last_on {
            if !self.send(protocol::encode_power(target.power)).await {
                return;
            }
            self.cache.last_on = target.power;
        }
        // Brightness and color are never sent (nor compared) while the
        // blade is off; an off-state value must not poison the cache.
        if !target.power {
            return;
        }

        if self.cache.last_brightness != Some(target.brightness) {
            if !self.send(protocol::encode_brightness(target.brightness)).await {
                return;
            }
            self.cache.last_brightness = Some(target.brightness);
        }

        if self.cache.last_color != Some(target.color) {
            let now = Instant::now();
            let window_open = self
                .cache
                .last_color_send
                .map_or(true, |sent| now.duration_since(sent) >= COLOR_DEBOUNCE);
            // A suppressed write leaves the cache untouched: the next
            // differing dispatch is evaluated against the value last sent.
            if window_open {
                let (r, g, b) = target.color;
                if !self.send(protocol::encode_color(r, g, b)).await {
                    return;
                }
                self.cache.last_color = Some(target.color);
                self.cache.last_color_send = Some(now);
            }
        }
    }

    /// Sound and effect commands sit outside the light-state cache: no
    /// redundancy suppression, authorization gate only.
    pub async fn dispatch_aux(&self, cmd: &AuxCommand) {
        if !self.gates.is_authorized() {
            return;
        }
        self.send(cmd.encode()).await;
    }

    /// Forget everything sent so far; paired with the sink's characteristic
    /// invalidation when the session drops.
    pub fn reset_cache(&mut self) {
        self.cache = DispatchCache::default();
    }

    fn accepts(&self, source: DispatchSource) -> bool {
        if source == DispatchSource::Local {
            if self.gates.is_syncing() {
                return false;
            }
            if self.wled_active.load(Ordering::SeqCst) {
                return false;
            }
        }
        self.gates.is_authorized()
    }

    /// Returns false only when the command channel is unresolved, which
    /// aborts the dispatch without touching the cache. A failed write after
    /// resolution counts as sent; the cache moves on and is reconciled by
    /// the next session reset.
    async fn send(&self, payload: Vec<u8>) -> bool {
        match self.sink.send_command(&payload).await {
            Ok(()) => {
                tracing::debug!(cmd = %String::from_utf8_lossy(&payload), "light cmd");
                true
            }
            Err(SendError::Unresolved) => {
                tracing::debug!("command channel not resolved, dropping dispatch");
                false
            }
            Err(err) => {
                tracing::warn!(error = %err, "ble write failed");
                true
            }
        }
    }
}

/// The platform reports RGB with brightness multiplied in (a fully red
/// light at 50% arrives as (0.5, 0, 0)); divide the brightness back out to
/// recover the hue, clamping overshoot, then truncate-quantize.
pub fn target_from_platform(state: &DesiredLightState) -> BladeTarget {
    let (mut r, mut g, mut b) = (state.red, state.green, state.blue);
    if state.on && state.brightness > 0.0 {
        r = (r / state.brightness).min(1.0);
        g = (g / state.brightness).min(1.0);
        b = (b / state.brightness).min(1.0);
    }
    BladeTarget {
        power: state.on,
        brightness: ((state.brightness * 100.0) as u8).min(100),
        color: ((r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{FailMode, RecordingSink};

    fn engine(sink: Arc<RecordingSink>) -> DispatchEngine<Arc<RecordingSink>> {
        let gates = SessionGates::new();
        gates.set_authorized(true);
        DispatchEngine::new(sink, gates, Arc::new(AtomicBool::new(false)))
    }

    fn on_red() -> BladeTarget {
        BladeTarget {
            power: true,
            brightness: 80,
            color: (255, 0, 0),
        }
    }

    #[tokio::test]
    async fn repeated_target_emits_once() {
        let sink = Arc::new(RecordingSink::new());
        let mut engine = engine(sink.clone());

        engine.dispatch(on_red(), DispatchSource::Local).await;
        assert_eq!(
            sink.sent(),
            vec![
                r#"[2,{"PowerOn":true}]"#,
                r#"[2,{"Brightness":80}]"#,
                r#"[2,{"BackgroundColor":[255,0,0]}]"#,
            ]
        );

        sink.clear();
        engine.dispatch(on_red(), DispatchSource::Local).await;
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn power_off_sends_power_only() {
        let sink = Arc::new(RecordingSink::new());
        let mut engine = engine(sink.clone());
        engine.dispatch(on_red(), DispatchSource::Local).await;
        sink.clear();

        let off = BladeTarget {
            power: false,
            brightness: 5,
            color: (1, 2, 3),
        };
        engine.dispatch(off, DispatchSource::Local).await;
        assert_eq!(sink.sent(), vec![r#"[2,{"PowerOn":false}]"#]);

        // The off-state brightness/color never reached the cache: turning
        // back on with the previous values re-sends nothing but power.
        sink.clear();
        engine.dispatch(on_red(), DispatchSource::Local).await;
        assert_eq!(sink.sent(), vec![r#"[2,{"PowerOn":true}]"#]);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_color_changes_collapse_within_window() {
        let sink = Arc::new(RecordingSink::new());
        let mut engine = engine(sink.clone());

        engine.dispatch(on_red(), DispatchSource::Local).await;
        sink.clear();

        // Inside the window: suppressed, cache still holds red.
        tokio::time::advance(Duration::from_millis(30)).await;
        let mut target = on_red();
        target.color = (0, 255, 0);
        engine.dispatch(target, DispatchSource::Local).await;
        assert!(sink.sent().is_empty());

        // Window reopens: evaluated against red, so green goes out now.
        tokio::time::advance(Duration::from_millis(80)).await;
        engine.dispatch(target, DispatchSource::Local).await;
        assert_eq!(sink.sent(), vec![r#"[2,{"BackgroundColor":[0,255,0]}]"#]);

        // Red again within the new window: differs from cache but stays
        // suppressed until the window reopens.
        sink.clear();
        tokio::time::advance(Duration::from_millis(50)).await;
        engine.dispatch(on_red(), DispatchSource::Local).await;
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn premultiplied_color_is_recovered() {
        let state = DesiredLightState {
            on: true,
            brightness: 0.5,
            red: 0.5,
            green: 0.25,
            blue: 0.0,
        };
        let target = target_from_platform(&state);
        assert_eq!(target.brightness, 50);
        assert_eq!(target.color, (255, 127, 0));
    }

    #[tokio::test]
    async fn recovered_overshoot_clamps_to_full() {
        let state = DesiredLightState {
            on: true,
            brightness: 0.5,
            red: 0.6,
            green: 0.0,
            blue: 0.0,
        };
        assert_eq!(target_from_platform(&state).color.0, 255);
    }

    #[tokio::test]
    async fn off_state_skips_recovery() {
        let state = DesiredLightState {
            on: false,
            brightness: 0.5,
            red: 0.5,
            green: 0.5,
            blue: 0.5,
        };
        // no division while off: quantized as-is
        assert_eq!(target_from_platform(&state).color, (127, 127, 127));
    }

    #[tokio::test]
    async fn unauthorized_blocks_every_source() {
        let sink = Arc::new(RecordingSink::new());
        let gates = SessionGates::new();
        let mut engine =
            DispatchEngine::new(sink.clone(), gates, Arc::new(AtomicBool::new(false)));

        engine.dispatch(on_red(), DispatchSource::Local).await;
        engine.dispatch(on_red(), DispatchSource::WledSync).await;
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn syncing_blocks_local_but_not_wled() {
        let sink = Arc::new(RecordingSink::new());
        let gates = SessionGates::new();
        gates.set_authorized(true);
        gates.set_syncing(true);
        let mut engine = DispatchEngine::new(
            sink.clone(),
            gates,
            Arc::new(AtomicBool::new(false)),
        );

        engine.dispatch(on_red(), DispatchSource::Local).await;
        assert!(sink.sent().is_empty());

        engine.dispatch(on_red(), DispatchSource::WledSync).await;
        assert_eq!(sink.sent().len(), 3);
    }

    #[tokio::test]
    async fn wled_mode_blocks_local_until_disabled() {
        let sink = Arc::new(RecordingSink::new());
        let gates = SessionGates::new();
        gates.set_authorized(true);
        let wled_active = Arc::new(AtomicBool::new(true));
        let mut engine = DispatchEngine::new(sink.clone(), gates, wled_active.clone());

        engine.dispatch(on_red(), DispatchSource::Local).await;
        assert!(sink.sent().is_empty());

        wled_active.store(false, Ordering::SeqCst);
        engine.dispatch(on_red(), DispatchSource::Local).await;
        assert_eq!(sink.sent()[0], r#"[2,{"PowerOn":true}]"#);
    }

    #[tokio::test]
    async fn unresolved_channel_leaves_cache_unset() {
        let sink = Arc::new(RecordingSink::new());
        let mut engine = engine(sink.clone());

        sink.set_fail(FailMode::Unresolved);
        engine.dispatch(on_red(), DispatchSource::Local).await;
        assert!(sink.sent().is_empty());

        // Once the channel resolves the same target goes out in full.
        sink.set_fail(FailMode::None);
        engine.dispatch(on_red(), DispatchSource::Local).await;
        assert_eq!(sink.sent().len(), 3);
    }

    #[tokio::test]
    async fn failed_write_still_advances_cache() {
        let sink = Arc::new(RecordingSink::new());
        let mut engine = engine(sink.clone());

        sink.set_fail(FailMode::WriteError);
        engine.dispatch(on_red(), DispatchSource::Local).await;
        sink.set_fail(FailMode::None);
        sink.clear();

        // The failed sends were cached as if they succeeded.
        engine.dispatch(on_red(), DispatchSource::Local).await;
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn cache_reset_resends_everything() {
        let sink = Arc::new(RecordingSink::new());
        let mut engine = engine(sink.clone());
        engine.dispatch(on_red(), DispatchSource::Local).await;
        sink.clear();

        engine.reset_cache();
        engine.dispatch(on_red(), DispatchSource::Local).await;
        assert_eq!(sink.sent().len(), 3);
    }

    #[tokio::test]
    async fn aux_commands_need_authorization_only() {
        let sink = Arc::new(RecordingSink::new());
        let gates = SessionGates::new();
        gates.set_syncing(true);
        let engine = DispatchEngine::new(
            sink.clone(),
            gates.clone(),
            Arc::new(AtomicBool::new(true)),
        );

        engine.dispatch_aux(&AuxCommand::Clash).await;
        assert!(sink.sent().is_empty());

        gates.set_authorized(true);
        engine.dispatch_aux(&AuxCommand::Clash).await;
        assert_eq!(sink.sent(), vec![r#"[2,{"Clash":true}]"#]);
    }
}
