//! Hierarchical bundler: compose messages with relative timestamps into a
//! single nested OSC bundle, with scoped capture and monotonic timetag
//! composition (spec §4.5 — "the central component").
//!
//! There's no direct analogue of the capture-scope mechanism in the teacher
//! workspace, but spec.md §9 is explicit about the shape to give it: "a
//! classic scoped-resource stack... implement via a scope guard that
//! installs on entry and restores on drop; never via global mutable
//! state." We follow that literally with a thread-local stack of handles
//! and an RAII guard (`BundlerScope`), matching the teacher's other
//! RAII/Drop-based resource management (e.g. `AudioHandle`'s `Drop` joins
//! its worker thread). Entries added as nested bundlers are snapshotted
//! (deep-copied) at `add` time rather than aliased, per spec.md's "may copy
//! on add" note — this sidesteps the "mutate after add is undefined"
//! ambiguity entirely instead of trying to detect it.
//!
//! The capture-scope *stack* is thread-local (only one bundler is "current"
//! per thread), but an individual `Bundler` handle still needs to cross
//! threads: `timedqueue::TimedQueue` hands deferred bundlers to its
//! background worker. So the shared state underneath is an `Arc<Mutex<_>>`
//! rather than an `Rc<RefCell<_>>` — cheap enough given bundlers are built
//! and flattened, not polled in a hot loop.

use std::cell::RefCell;
use std::sync::{Arc, Mutex};

use crate::error::{OscError, Result};
use crate::osc::timetag::now_unix_secs;
use crate::osc::{OscBundle, OscElement, OscMessage, OscPacket, OscTimeTag};

/// Anything a bundler can hand a flattened packet to on scope exit or
/// explicit `send`. Implemented by `transport::Transport`; kept as a trait
/// here so the bundler has no hard dependency on sockets and can be
/// exercised with a recording test double.
pub trait BundleSink: Send + Sync {
    fn send_packet(&self, peer: Option<&str>, packet: &OscPacket) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TimeBase {
    Immediate,
    /// Offset in seconds from whatever "now" the flatten call is anchored to.
    Relative(f64),
    /// Absolute Unix seconds.
    Absolute(f64),
}

impl TimeBase {
    fn from_caller(timetag: Option<f64>) -> Self {
        match timetag {
            None => TimeBase::Relative(0.0),
            Some(v) if v.abs() < crate::osc::timetag::RELATIVE_THRESHOLD => TimeBase::Relative(v),
            Some(v) => TimeBase::Absolute(v),
        }
    }
}

#[derive(Debug, Clone)]
enum EntryOwned {
    Message(OscMessage),
    Bundle(BundleSnapshot),
}

/// A deep, immutable copy of a bundler's state at the moment it was added
/// to a parent — see the module docs on why we snapshot instead of alias.
#[derive(Debug, Clone)]
struct BundleSnapshot {
    base: TimeBase,
    latency: f64,
    entries: Vec<(f64, EntryOwned)>,
}

struct BundlerInner {
    base: TimeBase,
    latency: f64,
    passed_time: f64,
    entries: Vec<(f64, EntryOwned)>,
    send_on_exit: bool,
    finalized: bool,
    sink: Option<Arc<dyn BundleSink>>,
    default_peer: Option<String>,
}

impl BundlerInner {
    fn snapshot(&self) -> BundleSnapshot {
        BundleSnapshot {
            base: self.base,
            latency: self.latency,
            entries: self.entries.clone(),
        }
    }
}

/// A mutable builder for a (possibly nested) set of timed OSC actions.
#[derive(Clone)]
pub struct Bundler {
    inner: Arc<Mutex<BundlerInner>>,
}

impl Bundler {
    /// `timetag` follows spec §4.5: `None` anchors the bundle to wall-clock
    /// at flatten; a magnitude under 1e6 is a relative offset from that
    /// wall-clock; anything larger is an absolute Unix timestamp.
    pub fn new(timetag: Option<f64>) -> Self {
        Bundler {
            inner: Arc::new(Mutex::new(BundlerInner {
                base: TimeBase::from_caller(timetag),
                latency: 0.0,
                passed_time: 0.0,
                entries: Vec::new(),
                send_on_exit: true,
                finalized: false,
                sink: None,
                default_peer: None,
            })),
        }
    }

    /// A bundler whose root timetag is the OSC "immediate" sentinel.
    pub fn immediate() -> Self {
        let b = Bundler::new(Some(0.0));
        b.inner.lock().unwrap().base = TimeBase::Immediate;
        b
    }

    pub fn with_send_on_exit(self, send_on_exit: bool) -> Self {
        self.inner.lock().unwrap().send_on_exit = send_on_exit;
        self
    }

    /// Construction-time latency added to this bundler's own base at
    /// flatten (spec §4.7); set by the server façade when it builds a
    /// bundler bound to a live transport.
    pub fn with_latency(self, latency: f64) -> Self {
        self.inner.lock().unwrap().latency = latency;
        self
    }

    /// Bind a sink + default peer so scope-exit / bare `send()` calls have
    /// somewhere to deliver the flattened datagram.
    pub fn with_sink(self, sink: Arc<dyn BundleSink>, peer: Option<&str>) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.sink = Some(sink);
            inner.default_peer = peer.map(|s| s.to_string());
        }
        self
    }

    fn check_not_finalized(&self) -> Result<()> {
        if self.inner.lock().unwrap().finalized {
            Err(OscError::Finalized)
        } else {
            Ok(())
        }
    }

    /// Append a message at `max(offset, 0)` relative seconds. Returns
    /// `self` (cheaply cloned — it's an `Arc` handle) to permit chaining.
    pub fn add(&self, offset: f64, message: OscMessage) -> Result<Self> {
        self.check_not_finalized()?;
        self.inner
            .lock()
            .unwrap()
            .entries
            .push((offset.max(0.0), EntryOwned::Message(message)));
        Ok(self.clone())
    }

    /// Convenience: build and append a message from an address + args.
    pub fn add_raw(
        &self,
        offset: f64,
        address: impl Into<String>,
        args: Vec<crate::osc::OscArg>,
    ) -> Result<Self> {
        self.add(offset, OscMessage::new(address, args))
    }

    /// Append a nested bundler, snapshotted at this moment.
    pub fn add_bundle(&self, offset: f64, child: &Bundler) -> Result<Self> {
        self.check_not_finalized()?;
        let snapshot = child.inner.lock().unwrap().snapshot();
        self.inner
            .lock()
            .unwrap()
            .entries
            .push((offset.max(0.0), EntryOwned::Bundle(snapshot)));
        Ok(self.clone())
    }

    /// Advance the write cursor. Subsequent `add` calls that rely on the
    /// capture-scope implicit offset (see `server::Server::msg`) use the
    /// resulting `passed_time`.
    pub fn wait(&self, delta: f64) -> Self {
        let mut inner = self.inner.lock().unwrap();
        inner.passed_time += delta.max(0.0);
        drop(inner);
        self.clone()
    }

    pub fn passed_time(&self) -> f64 {
        self.inner.lock().unwrap().passed_time
    }

    /// Ordered flat list of `(offset_from_root_seconds, message)` pairs,
    /// for inspection and testing.
    pub fn messages(&self) -> Vec<(f64, OscMessage)> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        collect_messages(0.0, &inner.snapshot(), &mut out);
        out
    }

    /// Render the complete nested OSC datagram anchored at `time_offset`
    /// (used as "now" for any relative base) plus this bundler's
    /// construction-time latency. Pure: same inputs, same bytes.
    pub fn to_raw_osc(&self, time_offset: f64) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let snapshot = inner.snapshot();
        let bundle = flatten_root(time_offset, &snapshot);
        OscPacket::Bundle(bundle)
            .encode()
            .expect("a bundler's own messages always encode")
    }

    /// Flatten anchored at the real wall clock and hand the datagram to the
    /// bound sink. Repeatable; does not finalize the bundler.
    pub fn send(&self, peer: Option<&str>) -> Result<()> {
        let (sink, default_peer, bytes) = {
            let inner = self.inner.lock().unwrap();
            let snapshot = inner.snapshot();
            let bundle = flatten_root(now_unix_secs(), &snapshot);
            (
                inner.sink.clone(),
                inner.default_peer.clone(),
                OscPacket::Bundle(bundle),
            )
        };
        let target = peer.map(|s| s.to_string()).or(default_peer);
        match sink {
            Some(sink) => sink.send_packet(target.as_deref(), &bytes),
            None => {
                log::warn!(target: "osc::bundler", "send() called on a bundler with no sink bound");
                Ok(())
            }
        }
    }

    /// Install this bundler as the thread-current capture target. Dropping
    /// the returned guard restores the previous current bundler; if this
    /// was the outermost scope, it also flattens+sends (unless
    /// `send_on_exit=false`) and finalizes the bundler.
    pub fn enter(&self) -> BundlerScope {
        CURRENT.with(|stack| stack.borrow_mut().push(self.clone()));
        BundlerScope {
            bundler: self.clone(),
        }
    }
}

fn collect_messages(base_abs: f64, snapshot: &BundleSnapshot, out: &mut Vec<(f64, OscMessage)>) {
    for (offset, entry) in &snapshot.entries {
        match entry {
            EntryOwned::Message(m) => out.push((base_abs + offset, m.clone())),
            EntryOwned::Bundle(child) => {
                let child_abs = resolve_child_abs(base_abs, *offset, child);
                collect_messages(child_abs, child, out);
            }
        }
    }
}

fn resolve_child_abs(parent_abs: f64, offset: f64, child: &BundleSnapshot) -> f64 {
    match child.base {
        TimeBase::Absolute(v) => v + child.latency,
        TimeBase::Relative(extra) => parent_abs + offset + extra,
        TimeBase::Immediate => parent_abs + offset,
    }
}

fn flatten_root(time_offset: f64, snapshot: &BundleSnapshot) -> OscBundle {
    let root_abs = match snapshot.base {
        TimeBase::Absolute(v) => v + snapshot.latency,
        TimeBase::Relative(off) => time_offset + off + snapshot.latency,
        TimeBase::Immediate => time_offset,
    };
    let timetag = if matches!(snapshot.base, TimeBase::Immediate) {
        OscTimeTag::immediate()
    } else {
        OscTimeTag::from_unix_secs_f64(root_abs)
    };
    OscBundle {
        timetag,
        elements: build_elements(root_abs, snapshot),
    }
}

fn build_elements(base_abs: f64, snapshot: &BundleSnapshot) -> Vec<OscElement> {
    snapshot
        .entries
        .iter()
        .map(|(offset, entry)| match entry {
            EntryOwned::Message(m) => OscElement::Bundle(OscBundle {
                timetag: OscTimeTag::from_unix_secs_f64(base_abs + offset),
                elements: vec![OscElement::Message(m.clone())],
            }),
            EntryOwned::Bundle(child) => {
                let child_abs = resolve_child_abs(base_abs, *offset, child);
                let timetag = if matches!(child.base, TimeBase::Immediate) {
                    OscTimeTag::immediate()
                } else {
                    OscTimeTag::from_unix_secs_f64(child_abs)
                };
                OscElement::Bundle(OscBundle {
                    timetag,
                    elements: build_elements(child_abs, child),
                })
            }
        })
        .collect()
}

thread_local! {
    static CURRENT: RefCell<Vec<Bundler>> = RefCell::new(Vec::new());
}

/// The innermost thread-current bundler, if any capture scope is active.
pub fn current_bundler() -> Option<Bundler> {
    CURRENT.with(|stack| stack.borrow().last().cloned())
}

/// RAII scope guard returned by [`Bundler::enter`].
pub struct BundlerScope {
    bundler: Bundler,
}

impl Drop for BundlerScope {
    fn drop(&mut self) {
        let was_outermost = CURRENT.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.pop();
            stack.is_empty()
        });
        if was_outermost {
            let send_on_exit = self.bundler.inner.lock().unwrap().send_on_exit;
            if send_on_exit {
                if let Err(e) = self.bundler.send(None) {
                    log::warn!(target: "osc::bundler", "scope-exit send failed: {e}");
                }
            }
            self.bundler.inner.lock().unwrap().finalized = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osc::OscArg;

    fn s_new(node: i32, freq: f32) -> OscMessage {
        OscMessage::new(
            "/s_new",
            vec![
                OscArg::from("s1"),
                OscArg::from(node),
                OscArg::from(1_i32),
                OscArg::from(0_i32),
                OscArg::from("freq"),
                OscArg::from(freq),
            ],
        )
    }

    #[test]
    fn flatten_is_deterministic() {
        let b = Bundler::new(Some(0.0));
        b.add(0.5, s_new(-1, 200.0)).unwrap();
        let a = b.to_raw_osc(1_700_000_000.0);
        let c = b.to_raw_osc(1_700_000_000.0);
        assert_eq!(a, c);
    }

    #[test]
    fn s2_add_vs_capture_scope_wait_are_byte_identical() {
        let b1 = Bundler::new(Some(0.0));
        b1.add(0.5, s_new(-1, 200.0)).unwrap();

        let b2 = Bundler::new(Some(0.0));
        {
            let _scope = b2.clone().with_send_on_exit(false).enter();
            let cur = current_bundler().unwrap();
            cur.wait(0.5);
            cur.add(cur.passed_time(), s_new(-1, 200.0)).unwrap();
        }

        assert_eq!(b1.to_raw_osc(0.0), b2.to_raw_osc(0.0));
    }

    #[test]
    fn nested_bundler_matches_explicit_offset() {
        let explicit = Bundler::new(Some(0.0));
        explicit.add(1.5, s_new(1, 300.0)).unwrap();

        let root = Bundler::new(Some(0.0));
        let child = Bundler::new(Some(0.0));
        child.add(0.0, s_new(1, 300.0)).unwrap();
        root.add_bundle(1.5, &child).unwrap();

        assert_eq!(explicit.to_raw_osc(0.0), root.to_raw_osc(0.0));
    }

    #[test]
    fn absolute_child_overrides_parent_offset() {
        let root = Bundler::new(Some(0.0));
        let child = Bundler::new(Some(2_000_000_000.0));
        child.add(0.0, s_new(1, 300.0)).unwrap();
        root.add_bundle(999.0, &child).unwrap();

        let msgs = root.messages();
        assert_eq!(msgs.len(), 1);
        assert!((msgs[0].0 - 2_000_000_000.0).abs() < 1e-9);
    }

    #[test]
    fn passed_time_is_monotonic_non_decreasing() {
        let b = Bundler::new(Some(0.0));
        let observed = RefCell::new(Vec::new());
        observed.borrow_mut().push(b.passed_time());
        b.wait(0.2);
        observed.borrow_mut().push(b.passed_time());
        b.wait(0.0);
        observed.borrow_mut().push(b.passed_time());
        b.wait(1.0);
        observed.borrow_mut().push(b.passed_time());
        let v = observed.into_inner();
        for w in v.windows(2) {
            assert!(w[1] >= w[0]);
        }
    }

    #[test]
    fn add_after_scope_exit_is_finalized() {
        let b = Bundler::new(Some(0.0)).with_send_on_exit(false);
        {
            let _scope = b.enter();
        }
        let err = b.add(0.0, s_new(1, 100.0)).unwrap_err();
        assert_eq!(err, OscError::Finalized);
    }

    #[test]
    fn nested_scopes_only_send_on_outermost_exit() {
        struct Recorder {
            count: std::sync::Mutex<u32>,
        }
        impl BundleSink for Recorder {
            fn send_packet(&self, _peer: Option<&str>, _packet: &OscPacket) -> Result<()> {
                *self.count.lock().unwrap() += 1;
                Ok(())
            }
        }
        let sink = Arc::new(Recorder {
            count: std::sync::Mutex::new(0),
        });
        let outer = Bundler::new(Some(0.0)).with_sink(sink.clone(), None);
        {
            let _outer_scope = outer.enter();
            let inner = Bundler::new(Some(0.0));
            {
                let _inner_scope = inner.enter();
            }
            assert_eq!(*sink.count.lock().unwrap(), 0);
        }
        assert_eq!(*sink.count.lock().unwrap(), 1);
    }
}
