//! The context: an immutable envelope flowing with a unit of work.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::tags::{TagSet, TagValue};
use crate::trace::Span;

thread_local! {
    static CURRENT_CONTEXT: RefCell<Context> = RefCell::new(Context::default());
}

/// A typed handle naming one context entry, with the value returned when
/// the entry is absent.
///
/// Keys are meant to live in statics; two keys with the same name and
/// value type address the same entry.
#[derive(Clone, Debug)]
pub struct Key<T> {
    name: &'static str,
    default: T,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clone + Send + Sync + 'static> Key<T> {
    /// Creates a key with the given default.
    pub fn new(name: &'static str, default: T) -> Key<T> {
        Key {
            name,
            default,
            _marker: PhantomData,
        }
    }

    /// The key's name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// An execution-scoped, immutable collection of values.
///
/// A context carries the current [`Span`], a set of user tags and any
/// number of typed entries, across API boundaries and (through the
/// propagation channels) across process boundaries. Write operations
/// return a new context; existing references never observe a change.
///
/// The context for the current thread is managed with [`Context::attach`]
/// and read with [`Context::current`]; dropping the returned guard
/// restores the previous context.
#[derive(Clone, Default)]
pub struct Context {
    span: Span,
    tags: TagSet,
    entries: HashMap<(TypeId, &'static str), Arc<dyn Any + Send + Sync>>,
}

impl Context {
    /// Creates an empty context: empty span, no tags, no entries.
    pub fn new() -> Context {
        Context::default()
    }

    /// An immutable snapshot of the current thread's context.
    pub fn current() -> Context {
        Context::map_current(|cx| cx.clone())
    }

    /// Applies `f` to the current thread's context without cloning it.
    pub fn map_current<T>(f: impl FnOnce(&Context) -> T) -> T {
        CURRENT_CONTEXT.with(|cx| f(&cx.borrow()))
    }

    /// The value stored under `key`, or the key's default when absent.
    pub fn get<T: Clone + Send + Sync + 'static>(&self, key: &Key<T>) -> T {
        self.entries
            .get(&(TypeId::of::<T>(), key.name))
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
            .unwrap_or_else(|| key.default.clone())
    }

    /// A copy of this context with `value` stored under `key`.
    pub fn with_value<T: Clone + Send + Sync + 'static>(&self, key: &Key<T>, value: T) -> Context {
        let mut next = self.clone();
        next.entries
            .insert((TypeId::of::<T>(), key.name), Arc::new(value));
        next
    }

    /// The span carried by this context; the empty span when none was
    /// set.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// A copy of this context carrying `span`.
    pub fn with_span(&self, span: Span) -> Context {
        let mut next = self.clone();
        next.span = span;
        next
    }

    /// The user tags carried by this context.
    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    /// A copy of this context with one additional tag.
    pub fn with_tag(&self, key: impl Into<String>, value: impl Into<TagValue>) -> Context {
        let mut next = self.clone();
        next.tags = next.tags.with_tag(key, value);
        next
    }

    /// A copy of this context with `tags` overlaid onto the existing
    /// ones.
    pub fn with_tags(&self, tags: TagSet) -> Context {
        let mut next = self.clone();
        next.tags = next.tags.merged_with(&tags);
        next
    }

    /// Makes this context the current one for the calling thread.
    ///
    /// Dropping the returned guard restores the previous context, so
    /// attachments nest.
    pub fn attach(self) -> ContextGuard {
        let previous = CURRENT_CONTEXT
            .try_with(|current| current.replace(self))
            .ok();
        ContextGuard {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("span", &self.span)
            .field("tags", &self.tags)
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Restores the previously attached context when dropped.
pub struct ContextGuard {
    previous: Option<Context>,
    // relies on thread locals, must not cross threads
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            let _ = CURRENT_CONTEXT.try_with(|current| current.replace(previous));
        }
    }
}

impl fmt::Debug for ContextGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextGuard").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{Identifier, SamplingDecision, Trace};

    #[test]
    fn get_returns_the_default_when_absent() {
        let key = Key::new("request-depth", 0i64);
        let cx = Context::new();
        assert_eq!(cx.get(&key), 0);

        let cx = cx.with_value(&key, 7);
        assert_eq!(cx.get(&key), 7);
    }

    #[test]
    fn writes_do_not_mutate_the_original() {
        let key = Key::new("label", String::new());
        let base = Context::new();
        let derived = base.with_value(&key, "set".to_owned()).with_tag("env", "prod");

        assert_eq!(base.get(&key), "");
        assert!(base.tags().is_empty());
        assert_eq!(derived.get(&key), "set");
        assert_eq!(derived.tags().get_string("env"), Some("prod"));
    }

    #[test]
    fn span_slot_defaults_to_the_empty_span() {
        let cx = Context::new();
        assert!(cx.span().is_empty());

        let remote = Span::remote(
            Identifier::from_hex("00000000000000ab").unwrap(),
            Identifier::empty(),
            Trace::new(
                Identifier::from_hex("00000000000000cd").unwrap(),
                SamplingDecision::Sample,
            ),
        );
        let with_span = cx.with_span(remote);
        assert_eq!(with_span.span().id().hex(), "00000000000000ab");
    }

    #[test]
    fn attachments_nest_and_restore() {
        let key = Key::new("value", 0i64);

        let outer = Context::new().with_value(&key, 1);
        let outer_guard = outer.attach();
        assert_eq!(Context::current().get(&key), 1);

        {
            let inner = Context::current().with_value(&key, 2);
            let _inner_guard = inner.attach();
            assert_eq!(Context::current().get(&key), 2);
        }

        assert_eq!(Context::current().get(&key), 1);
        drop(outer_guard);
        assert_eq!(Context::current().get(&key), 0);
    }
}
