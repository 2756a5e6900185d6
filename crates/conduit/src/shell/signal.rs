//! Kill signals
//!
//! A `KillSignal` is how a shell tells the processes launched beneath it to
//! stop. Signals propagate from a parent to every child signal derived from
//! it (subshells, pipeline stages), never the other way around.

use std::sync::{Arc, Mutex, Weak};

use nix::sys::signal::Signal;
use tokio::sync::broadcast;

// ============================================================================
// Kill Signal
// ============================================================================

#[derive(Debug)]
struct KillSignalInner {
    aborted_with: Mutex<Option<SignalKind>>,
    sender: broadcast::Sender<SignalKind>,
    children: Mutex<Vec<Weak<KillSignalInner>>>,
}

impl KillSignalInner {
    fn new(aborted_with: Option<SignalKind>) -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            aborted_with: Mutex::new(aborted_with),
            sender,
            children: Mutex::new(Vec::new()),
        }
    }

    fn send(&self, signal_kind: SignalKind) {
        if signal_kind.causes_abort() {
            let mut stored = lock(&self.aborted_with);
            if stored.is_none() {
                *stored = Some(signal_kind);
            }
        }
        let _ = self.sender.send(signal_kind);

        // Collect first so a child's lock is never taken under ours
        let children: Vec<Arc<KillSignalInner>> = {
            let mut children = lock(&self.children);
            children.retain(|weak| weak.strong_count() > 0);
            children.iter().filter_map(Weak::upgrade).collect()
        };
        for child in children {
            child.send(signal_kind);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Signal for stopping processes launched by a shell.
///
/// Cloning shares the same signal; [`child_signal`](Self::child_signal)
/// derives a new one that also receives everything sent to this one.
#[derive(Debug, Clone)]
pub struct KillSignal(Arc<KillSignalInner>);

impl Default for KillSignal {
    fn default() -> Self {
        Self(Arc::new(KillSignalInner::new(None)))
    }
}

impl KillSignal {
    /// The first aborting signal sent, if any.
    pub fn aborted_with(&self) -> Option<SignalKind> {
        *lock(&self.0.aborted_with)
    }

    /// Exit code for the abort (128 + signal number), if aborted.
    pub fn aborted_code(&self) -> Option<i32> {
        self.aborted_with().map(|kind| kind.aborted_code())
    }

    /// Create a child signal that receives this signal's sends.
    pub fn child_signal(&self) -> Self {
        let child = Arc::new(KillSignalInner::new(None));
        let mut children = lock(&self.0.children);
        children.retain(|weak| weak.strong_count() > 0);
        children.push(Arc::downgrade(&child));
        drop(children);
        // Covers an abort that raced with registration.
        if let Some(kind) = self.aborted_with() {
            child.send(kind);
        }
        Self(child)
    }

    /// Create a drop guard that sends SIGTERM on drop.
    pub fn drop_guard(self) -> KillSignalDropGuard {
        self.drop_guard_with_kind(SignalKind::SIGTERM)
    }

    /// Create a drop guard with a specific signal.
    pub fn drop_guard_with_kind(self, kind: SignalKind) -> KillSignalDropGuard {
        KillSignalDropGuard {
            disarmed: false,
            kill_signal_kind: kind,
            signal: self,
        }
    }

    /// Send a signal to this signal and all children.
    pub fn send(&self, signal: SignalKind) {
        self.0.send(signal)
    }

    /// Send SIGTERM.
    pub fn send_sigterm(&self) {
        self.send(SignalKind::SIGTERM)
    }

    /// Send SIGKILL.
    pub fn send_sigkill(&self) {
        self.send(SignalKind::SIGKILL)
    }

    /// Wait for an aborting signal.
    ///
    /// Returns immediately if one was already sent.
    pub async fn wait_aborted(&self) -> SignalKind {
        let mut receiver = self.0.sender.subscribe();
        if let Some(kind) = self.aborted_with() {
            return kind;
        }
        loop {
            match receiver.recv().await {
                Ok(signal) if signal.causes_abort() => return signal,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if let Some(kind) = self.aborted_with() {
                        return kind;
                    }
                }
                // The sender lives in `self`, so the channel cannot close
                // while we hold it.
                Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    }
}

/// Guard that sends a signal on drop unless disarmed.
#[derive(Debug)]
pub struct KillSignalDropGuard {
    disarmed: bool,
    kill_signal_kind: SignalKind,
    signal: KillSignal,
}

impl Drop for KillSignalDropGuard {
    fn drop(&mut self) {
        if !self.disarmed {
            self.signal.send(self.kill_signal_kind);
        }
    }
}

impl KillSignalDropGuard {
    /// Prevent the guard from sending a signal on drop.
    pub fn disarm(mut self) {
        self.disarmed = true;
    }
}

// ============================================================================
// Signal Kinds
// ============================================================================

/// Signals a shell can deliver to its processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    SIGTERM,
    SIGKILL,
    SIGABRT,
    SIGQUIT,
    SIGINT,
    SIGSTOP,
    Other(i32),
}

impl SignalKind {
    /// Whether this signal aborts the invocation.
    pub fn causes_abort(&self) -> bool {
        !matches!(self, SignalKind::Other(_))
    }

    /// Exit code for an abort (128 + signal number).
    pub fn aborted_code(&self) -> i32 {
        128 + i32::from(*self)
    }

    /// The platform signal, if this number is one.
    pub fn to_nix(self) -> Option<Signal> {
        Signal::try_from(i32::from(self)).ok()
    }
}

impl From<i32> for SignalKind {
    fn from(value: i32) -> Self {
        use nix::libc;
        match value {
            libc::SIGINT => SignalKind::SIGINT,
            libc::SIGQUIT => SignalKind::SIGQUIT,
            libc::SIGABRT => SignalKind::SIGABRT,
            libc::SIGKILL => SignalKind::SIGKILL,
            libc::SIGTERM => SignalKind::SIGTERM,
            libc::SIGSTOP => SignalKind::SIGSTOP,
            _ => SignalKind::Other(value),
        }
    }
}

impl From<SignalKind> for i32 {
    fn from(kind: SignalKind) -> i32 {
        use nix::libc;
        match kind {
            SignalKind::SIGINT => libc::SIGINT,
            SignalKind::SIGQUIT => libc::SIGQUIT,
            SignalKind::SIGABRT => libc::SIGABRT,
            SignalKind::SIGKILL => libc::SIGKILL,
            SignalKind::SIGTERM => libc::SIGTERM,
            SignalKind::SIGSTOP => libc::SIGSTOP,
            SignalKind::Other(value) => value,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_signal_kind_conversion() {
        assert_eq!(SignalKind::from(9), SignalKind::SIGKILL);
        assert_eq!(i32::from(SignalKind::SIGKILL), 9);
        assert_eq!(SignalKind::SIGKILL.aborted_code(), 137);
        assert_eq!(SignalKind::SIGTERM.to_nix(), Some(Signal::SIGTERM));
        assert!(!SignalKind::Other(10).causes_abort());
    }

    #[test]
    fn test_parent_reaches_children_only() {
        let parent = KillSignal::default();
        let child = parent.child_signal();
        let grandchild = child.child_signal();

        child.send(SignalKind::SIGINT);
        assert_eq!(parent.aborted_with(), None);
        assert_eq!(grandchild.aborted_with(), Some(SignalKind::SIGINT));

        parent.send_sigkill();
        assert_eq!(parent.aborted_with(), Some(SignalKind::SIGKILL));
        // The first abort wins
        assert_eq!(child.aborted_with(), Some(SignalKind::SIGINT));
    }

    #[test]
    fn test_child_inherits_existing_abort() {
        let parent = KillSignal::default();
        parent.send_sigterm();
        assert_eq!(parent.child_signal().aborted_code(), Some(143));
    }

    #[test]
    fn test_drop_guard() {
        let signal = KillSignal::default();
        signal.clone().drop_guard().disarm();
        assert_eq!(signal.aborted_with(), None);

        drop(signal.clone().drop_guard());
        assert_eq!(signal.aborted_with(), Some(SignalKind::SIGTERM));
    }

    #[tokio::test]
    async fn test_wait_aborted() {
        let signal = KillSignal::default();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.wait_aborted().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.send(SignalKind::Other(10));
        signal.send_sigterm();
        assert_eq!(handle.await.unwrap(), SignalKind::SIGTERM);

        // Already aborted: returns without waiting
        assert_eq!(signal.wait_aborted().await, SignalKind::SIGTERM);
    }
}
