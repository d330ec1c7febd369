//! Ambient connectivity/focus sources that drive pause/resume and
//! focus-triggered refetches.
//!
//! Both managers share one shape: a current boolean, a change event fired
//! only on actual transitions, a manual override, and a pluggable listener
//! so a host application can wire in platform detection (browser
//! `online`/`visibilitychange` events, and so on) without this crate
//! depending on any platform API.

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Cleanup for a previously installed custom listener.
pub type CleanupFn = Box<dyn FnOnce() + Send + Sync>;

/// Handle an external listener uses to push state transitions into a
/// manager without holding a direct reference to it.
#[derive(Clone)]
pub struct StatusSetter {
    inner: Arc<Inner>,
}

impl StatusSetter {
    pub fn set(&self, value: bool) {
        Inner::set(&self.inner, value);
    }
}

impl fmt::Debug for StatusSetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusSetter").field("value", &self.inner.tx.borrow()).finish()
    }
}

/// Dropping the guard runs the cleanup callback returned by the listener
/// that installed it, mirroring how a DOM `removeEventListener` handle
/// would be released.
pub struct ListenerGuard {
    cleanup: Option<CleanupFn>,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

struct Inner {
    tx: watch::Sender<bool>,
}

impl Inner {
    fn set(this: &Arc<Self>, value: bool) {
        this.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
    }
}

/// A two-state ambient signal (`OnlineManager`/`FocusManager` share this
/// implementation; see the type aliases below).
#[derive(Clone)]
pub struct StatusManager {
    inner: Arc<Inner>,
}

impl StatusManager {
    /// Defaults to "always on" per spec — platform detection is wired in
    /// later via [`StatusManager::set_custom_listener`].
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(true);
        Self { inner: Arc::new(Inner { tx }) }
    }

    pub fn value(&self) -> bool {
        *self.inner.tx.borrow()
    }

    /// Forces the state; fires the change event only if it actually flips.
    pub fn set(&self, value: bool) {
        Inner::set(&self.inner, value);
    }

    /// Subscribe to transitions. The returned receiver's `changed()` future
    /// resolves whenever [`StatusManager::set`] flips the value.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.tx.subscribe()
    }

    /// Wait until the value becomes `true`, honoring the transition
    /// semantics above. Returns immediately if already `true`.
    pub async fn wait_until_true(&self) {
        let mut rx = self.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Like [`StatusManager::wait_until_true`], but also races `token`'s
    /// cancellation so a caller paused here can return early rather than
    /// only noticing cancellation once the value flips and it tries to
    /// fetch. Returns `true` if the value became `true`, `false` if `token`
    /// was cancelled first.
    pub async fn wait_until_true_cancellable(&self, token: &CancellationToken) -> bool {
        let mut rx = self.subscribe();
        while !*rx.borrow() {
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = token.cancelled() => return false,
            }
        }
        true
    }

    /// Install a platform listener. `build` receives a [`StatusSetter`] it
    /// can hand to platform event callbacks, and returns a cleanup closure
    /// run when the returned guard is dropped.
    pub fn set_custom_listener(
        &self,
        build: impl FnOnce(StatusSetter) -> CleanupFn,
    ) -> ListenerGuard {
        let setter = StatusSetter { inner: Arc::clone(&self.inner) };
        let cleanup = build(setter);
        ListenerGuard { cleanup: Some(cleanup) }
    }
}

impl Default for StatusManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StatusManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusManager").field("value", &self.value()).finish()
    }
}

/// Drives pause/resume and `refetchOnReconnect`.
#[derive(Clone, Debug, Default)]
pub struct OnlineManager(StatusManager);

impl OnlineManager {
    pub fn new() -> Self {
        Self(StatusManager::new())
    }

    pub fn is_online(&self) -> bool {
        self.0.value()
    }

    pub fn set_online(&self, online: bool) {
        self.0.set(online);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.0.subscribe()
    }

    pub async fn wait_until_online(&self) {
        self.0.wait_until_true().await;
    }

    /// Returns `true` once online, `false` if `token` is cancelled first.
    pub async fn wait_until_online_cancellable(&self, token: &CancellationToken) -> bool {
        self.0.wait_until_true_cancellable(token).await
    }

    pub fn set_custom_listener(
        &self,
        build: impl FnOnce(StatusSetter) -> CleanupFn,
    ) -> ListenerGuard {
        self.0.set_custom_listener(build)
    }
}

/// Drives `refetchOnWindowFocus`.
#[derive(Clone, Debug, Default)]
pub struct FocusManager(StatusManager);

impl FocusManager {
    pub fn new() -> Self {
        Self(StatusManager::new())
    }

    pub fn is_focused(&self) -> bool {
        self.0.value()
    }

    pub fn set_focused(&self, focused: bool) {
        self.0.set(focused);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.0.subscribe()
    }

    pub fn set_custom_listener(
        &self,
        build: impl FnOnce(StatusSetter) -> CleanupFn,
    ) -> ListenerGuard {
        self.0.set_custom_listener(build)
    }
}
