//! Signal manager
//!
//! Maps signal numbers to ordered lists of listeners. OS handlers are installed
//! through the signal-hook crate the first time a signal gets a listener; the
//! handler only records the arrival, and the loop dispatches recorded signals
//! from the first phase of every tick. There is no asynchronous preemption.
//!
//! Termination-class signals (SIGHUP, SIGINT, SIGQUIT, SIGTERM) that arrive
//! while no listener is enabled for them are handed to the loop's
//! [`TerminationPolicy`], so installing a listener and later disabling it does
//! not make the process immune to them.

use signal_hook::iterator::Signals;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::rc::Rc;

use crate::config::{TerminationPolicy, TERMINATION_SIGNALS};
use crate::error::{Error, Result};
use crate::event_loop::LoopInner;

pub(crate) type SignalCallback = Box<dyn FnMut(i32) -> Result<()>>;

/// Where arrived signals come from.
pub trait SignalSource {
    fn name(&self) -> &'static str;

    /// Installs an OS handler for `signo`. Called once per signal number.
    fn register(&mut self, signo: i32) -> io::Result<()>;

    /// Drains the signals that arrived since the previous call.
    fn pending(&mut self) -> Vec<i32>;
}

/// Signal source backed by `signal_hook::iterator::Signals`.
pub struct HookSource {
    signals: Signals,
}

impl HookSource {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            signals: Signals::new(std::iter::empty::<i32>())?,
        })
    }
}

impl SignalSource for HookSource {
    fn name(&self) -> &'static str {
        "signal-hook"
    }

    fn register(&mut self, signo: i32) -> io::Result<()> {
        self.signals.add_signal(signo)
    }

    fn pending(&mut self) -> Vec<i32> {
        self.signals.pending().collect()
    }
}

/// Source used when signal handling is disabled; nothing ever arrives.
#[derive(Debug, Default)]
pub struct NullSource;

impl SignalSource for NullSource {
    fn name(&self) -> &'static str {
        "none"
    }

    fn register(&mut self, _signo: i32) -> io::Result<()> {
        Ok(())
    }

    fn pending(&mut self) -> Vec<i32> {
        Vec::new()
    }
}

/// The source chosen when the loop was built.
pub(crate) enum Source {
    Hook(HookSource),
    Null(NullSource),
}

impl Source {
    /// Uses signal-hook when `enabled` and available, `NullSource` otherwise.
    pub(crate) fn probe(enabled: bool) -> Self {
        if !enabled {
            return Source::Null(NullSource);
        }
        match HookSource::new() {
            Ok(source) => Source::Hook(source),
            Err(e) => {
                tracing::warn!("signal handling unavailable: {}", e);
                Source::Null(NullSource)
            }
        }
    }
}

impl SignalSource for Source {
    fn name(&self) -> &'static str {
        match self {
            Source::Hook(s) => s.name(),
            Source::Null(s) => s.name(),
        }
    }

    fn register(&mut self, signo: i32) -> io::Result<()> {
        match self {
            Source::Hook(s) => s.register(signo),
            Source::Null(s) => s.register(signo),
        }
    }

    fn pending(&mut self) -> Vec<i32> {
        match self {
            Source::Hook(s) => s.pending(),
            Source::Null(s) => s.pending(),
        }
    }
}

pub(crate) struct SignalEntry {
    signo: i32,
    enabled: Cell<bool>,
    callback: RefCell<SignalCallback>,
}

/// Listener registry for one loop.
pub(crate) struct SignalManager {
    source: Source,
    listeners: HashMap<i32, Vec<Rc<SignalEntry>>>,
    registered: HashSet<i32>,
    termination: TerminationPolicy,
}

impl SignalManager {
    pub(crate) fn new(source: Source, termination: TerminationPolicy) -> Self {
        let mut manager = Self {
            source,
            listeners: HashMap::new(),
            registered: HashSet::new(),
            termination,
        };
        // Stopping the loop needs the handlers in place before any listener
        // exists; the OS default action does not.
        if termination == TerminationPolicy::StopLoop {
            for signo in TERMINATION_SIGNALS {
                if let Err(e) = manager.register(signo) {
                    tracing::warn!("cannot watch termination signal {}: {}", signo, e);
                }
            }
        }
        manager
    }

    pub(crate) fn is_enabled(&self) -> bool {
        matches!(self.source, Source::Hook(_))
    }

    pub(crate) fn termination(&self) -> TerminationPolicy {
        self.termination
    }

    pub(crate) fn listen(&mut self, signo: i32, callback: SignalCallback) -> Result<Rc<SignalEntry>> {
        validate(signo)?;
        self.register(signo)?;
        let entry = Rc::new(SignalEntry {
            signo,
            enabled: Cell::new(true),
            callback: RefCell::new(callback),
        });
        self.listeners.entry(signo).or_default().push(Rc::clone(&entry));
        Ok(entry)
    }

    /// Signals recorded since the last call, in ascending order.
    pub(crate) fn arrived(&mut self) -> Vec<i32> {
        let mut arrived = self.source.pending();
        arrived.sort_unstable();
        arrived.dedup();
        arrived
    }

    /// Enabled listeners for `signo`, in registration order.
    pub(crate) fn enabled(&self, signo: i32) -> Vec<Rc<SignalEntry>> {
        self.listeners
            .get(&signo)
            .map(|entries| entries.iter().filter(|e| e.enabled.get()).cloned().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self, signo: i32) -> usize {
        self.listeners.get(&signo).map_or(0, Vec::len)
    }

    fn register(&mut self, signo: i32) -> io::Result<()> {
        if self.registered.contains(&signo) {
            return Ok(());
        }
        self.source.register(signo)?;
        self.registered.insert(signo);
        tracing::debug!("installed handler for signal {} via {}", signo, self.source.name());
        Ok(())
    }
}

/// Rejects numbers that are not signals or that cannot be handled at all.
fn validate(signo: i32) -> Result<()> {
    if nix::sys::signal::Signal::try_from(signo).is_err() || signal_hook::consts::FORBIDDEN.contains(&signo) {
        return Err(Error::InvalidSignal(signo));
    }
    Ok(())
}

/// Dispatches every signal that arrived since the previous tick.
pub(crate) fn dispatch(inner: &LoopInner) -> Result<usize> {
    let arrived = inner.signals.borrow_mut().arrived();
    let mut count = 0;
    for signo in arrived {
        let listeners = inner.signals.borrow().enabled(signo);
        if listeners.is_empty() {
            if TERMINATION_SIGNALS.contains(&signo) {
                terminate(inner, signo)?;
            }
            continue;
        }
        tracing::trace!("dispatching signal {} to {} listeners", signo, listeners.len());
        for entry in listeners {
            // An earlier listener may have disabled this one.
            if entry.enabled.get() {
                count += 1;
                (entry.callback.borrow_mut())(signo)?;
            }
        }
    }
    Ok(count)
}

fn terminate(inner: &LoopInner, signo: i32) -> Result<()> {
    let policy = inner.signals.borrow().termination();
    tracing::warn!("termination signal {} has no enabled listener, applying {:?}", signo, policy);
    match policy {
        TerminationPolicy::Terminate => {
            signal_hook::low_level::emulate_default_handler(signo)?;
        }
        TerminationPolicy::StopLoop => inner.stop(),
    }
    Ok(())
}

/// Handle to a signal listener.
///
/// Disabling a listener stops it from being invoked without removing it; it can
/// be enabled again at any time.
#[derive(Clone)]
pub struct Signal {
    entry: Rc<SignalEntry>,
}

impl Signal {
    pub(crate) fn new(entry: Rc<SignalEntry>) -> Self {
        Self { entry }
    }

    pub fn signo(&self) -> i32 {
        self.entry.signo
    }

    pub fn enable(&self) {
        self.entry.enabled.set(true);
    }

    pub fn disable(&self) {
        self.entry.enabled.set(false);
    }

    pub fn is_enabled(&self) -> bool {
        self.entry.enabled.get()
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("signo", &self.entry.signo)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
