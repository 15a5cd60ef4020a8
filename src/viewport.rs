//! Responsive breakpoints over a media-query facility.
//!
//! [`MediaQuery`] keeps a live boolean for one query. It reads `false` until
//! a [`DisplayContext`] is attached, then follows the context's change
//! notifications. Each subscription is removed when the query is re-attached,
//! detached or dropped.
//!
//! [`Viewport`] is an in-memory display context that understands width and
//! height range features, e.g. `(min-width: 768px) and (max-width: 1023px)`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::ViewportError;

pub const MOBILE_QUERY: &str = "(max-width: 767px)";
pub const TABLET_QUERY: &str = "(min-width: 768px) and (max-width: 1023px)";
pub const DESKTOP_QUERY: &str = "(min-width: 1024px)";

pub type ListenerId = u64;
pub type ChangeListener = Arc<dyn Fn(bool) + Send + Sync>;

/// A live, subscribable evaluation of one media query.
pub trait MediaQueryList: Send + Sync {
    fn media(&self) -> &str;
    fn matches(&self) -> bool;
    /// `listener` receives the new value whenever the evaluation flips.
    fn add_listener(&self, listener: ChangeListener) -> ListenerId;
    fn remove_listener(&self, id: ListenerId);
}

pub trait DisplayContext: Send + Sync {
    fn match_media(&self, query: &str) -> Result<Arc<dyn MediaQueryList>, ViewportError>;
}

struct Subscription {
    list: Arc<dyn MediaQueryList>,
    id: ListenerId,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.list.remove_listener(self.id);
    }
}

pub struct MediaQuery {
    query: String,
    value: Arc<AtomicBool>,
    subscription: Option<Subscription>,
}

impl MediaQuery {
    /// Track `query`. With no context the value is `false`.
    pub fn new(
        query: impl Into<String>,
        context: Option<&dyn DisplayContext>,
    ) -> Result<Self, ViewportError> {
        let mut mq = Self {
            query: query.into(),
            value: Arc::new(AtomicBool::new(false)),
            subscription: None,
        };
        if let Some(context) = context {
            mq.attach(context)?;
        }
        Ok(mq)
    }

    pub fn mobile(context: Option<&dyn DisplayContext>) -> Result<Self, ViewportError> {
        Self::new(MOBILE_QUERY, context)
    }

    pub fn tablet(context: Option<&dyn DisplayContext>) -> Result<Self, ViewportError> {
        Self::new(TABLET_QUERY, context)
    }

    pub fn desktop(context: Option<&dyn DisplayContext>) -> Result<Self, ViewportError> {
        Self::new(DESKTOP_QUERY, context)
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn matches(&self) -> bool {
        self.value.load(Ordering::SeqCst)
    }

    /// Subscribe to `context`, replacing any earlier subscription.
    /// On error the query is left detached and reads `false`.
    pub fn attach(&mut self, context: &dyn DisplayContext) -> Result<(), ViewportError> {
        self.detach();

        let list = context.match_media(&self.query)?;
        let value = self.value.clone();
        let id = list.add_listener(Arc::new(move |matches| {
            value.store(matches, Ordering::SeqCst);
        }));
        self.value.store(list.matches(), Ordering::SeqCst);
        debug!("Media query '{}' attached (matches={})", self.query, self.matches());

        self.subscription = Some(Subscription { list, id });
        Ok(())
    }

    /// Drop the subscription; the value reads `false` again.
    pub fn detach(&mut self) {
        self.subscription = None;
        self.value.store(false, Ordering::SeqCst);
    }

    /// Switch to a new query, re-subscribing if a context is given.
    pub fn set_query(
        &mut self,
        query: impl Into<String>,
        context: Option<&dyn DisplayContext>,
    ) -> Result<(), ViewportError> {
        self.detach();
        self.query = query.into();
        match context {
            Some(context) => self.attach(context),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Feature {
    MinWidth(f64),
    MaxWidth(f64),
    MinHeight(f64),
    MaxHeight(f64),
}

#[derive(Debug, Clone, PartialEq)]
struct ParsedQuery(Vec<Feature>);

impl ParsedQuery {
    fn parse(query: &str) -> Result<Self, ViewportError> {
        let invalid = |reason: &str| ViewportError::InvalidQuery {
            query: query.to_string(),
            reason: reason.to_string(),
        };

        let lowered = query.trim().to_ascii_lowercase();
        if lowered.is_empty() {
            return Err(invalid("empty query"));
        }

        let mut features = Vec::new();
        for clause in lowered.split(" and ").map(str::trim) {
            if clause == "screen" || clause == "all" {
                continue;
            }
            let inner = clause
                .strip_prefix('(')
                .and_then(|c| c.strip_suffix(')'))
                .ok_or_else(|| invalid("expected a parenthesized feature"))?;
            let (name, value) = inner
                .split_once(':')
                .ok_or_else(|| invalid("expected 'feature: value'"))?;
            let px: f64 = value
                .trim()
                .strip_suffix("px")
                .ok_or_else(|| invalid("lengths must be in px"))?
                .trim()
                .parse()
                .map_err(|_| invalid("length is not a number"))?;

            features.push(match name.trim() {
                "min-width" => Feature::MinWidth(px),
                "max-width" => Feature::MaxWidth(px),
                "min-height" => Feature::MinHeight(px),
                "max-height" => Feature::MaxHeight(px),
                _ => return Err(invalid("unsupported feature")),
            });
        }

        Ok(Self(features))
    }

    fn evaluate(&self, width: u32, height: u32) -> bool {
        let (w, h) = (f64::from(width), f64::from(height));
        self.0.iter().all(|f| match *f {
            Feature::MinWidth(px) => w >= px,
            Feature::MaxWidth(px) => w <= px,
            Feature::MinHeight(px) => h >= px,
            Feature::MaxHeight(px) => h <= px,
        })
    }
}

struct Registered {
    query: Arc<ParsedQuery>,
    last: bool,
    listener: ChangeListener,
}

struct ViewportInner {
    width: u32,
    height: u32,
    next_id: ListenerId,
    listeners: HashMap<ListenerId, Registered>,
}

fn lock(inner: &Mutex<ViewportInner>) -> MutexGuard<'_, ViewportInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An in-memory display context with a resizable viewport.
#[derive(Clone)]
pub struct Viewport {
    inner: Arc<Mutex<ViewportInner>>,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ViewportInner {
                width,
                height,
                next_id: 0,
                listeners: HashMap::new(),
            })),
        }
    }

    pub fn size(&self) -> (u32, u32) {
        let inner = lock(&self.inner);
        (inner.width, inner.height)
    }

    /// Resize and notify listeners whose query flipped.
    pub fn resize(&self, width: u32, height: u32) {
        let changed: Vec<(ChangeListener, bool)> = {
            let mut inner = lock(&self.inner);
            inner.width = width;
            inner.height = height;
            inner
                .listeners
                .values_mut()
                .filter_map(|r| {
                    let now = r.query.evaluate(width, height);
                    (now != r.last).then(|| {
                        r.last = now;
                        (r.listener.clone(), now)
                    })
                })
                .collect()
        };

        debug!("Viewport resized to {width}x{height}, {} listeners notified", changed.len());
        for (listener, matches) in changed {
            listener(matches);
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner).listeners.len()
    }
}

impl DisplayContext for Viewport {
    fn match_media(&self, query: &str) -> Result<Arc<dyn MediaQueryList>, ViewportError> {
        let parsed = ParsedQuery::parse(query)?;
        Ok(Arc::new(ViewportQueryList {
            media: query.to_string(),
            query: Arc::new(parsed),
            inner: self.inner.clone(),
        }))
    }
}

struct ViewportQueryList {
    media: String,
    query: Arc<ParsedQuery>,
    inner: Arc<Mutex<ViewportInner>>,
}

impl MediaQueryList for ViewportQueryList {
    fn media(&self) -> &str {
        &self.media
    }

    fn matches(&self) -> bool {
        let inner = lock(&self.inner);
        self.query.evaluate(inner.width, inner.height)
    }

    fn add_listener(&self, listener: ChangeListener) -> ListenerId {
        let mut inner = lock(&self.inner);
        inner.next_id += 1;
        let id = inner.next_id;
        let last = self.query.evaluate(inner.width, inner.height);
        inner.listeners.insert(
            id,
            Registered {
                query: self.query.clone(),
                last,
                listener,
            },
        );
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        lock(&self.inner).listeners.remove(&id);
    }
}
