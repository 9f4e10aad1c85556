use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;

use bproxy_protocol::StreamingMode;

/// Admin-togglable runtime switches. Readers take an immutable snapshot per
/// request; writers swap the whole set.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeFlags {
    pub streaming_mode: StreamingMode,
    /// Inject thinking output into translated OpenAI requests.
    pub openai_reasoning: bool,
    /// Inject thinking output into native Gemini generative requests.
    pub native_reasoning: bool,
    pub redirect_25_to_30: bool,
    pub resume_limit: u32,
    pub enable_resume: bool,
}

pub struct FlagStore {
    inner: ArcSwap<RuntimeFlags>,
}

impl FlagStore {
    pub fn new(streaming_mode: StreamingMode) -> Self {
        Self {
            inner: ArcSwap::from_pointee(RuntimeFlags {
                streaming_mode,
                openai_reasoning: false,
                native_reasoning: false,
                redirect_25_to_30: false,
                resume_limit: 0,
                enable_resume: false,
            }),
        }
    }

    pub fn snapshot(&self) -> Arc<RuntimeFlags> {
        self.inner.load_full()
    }

    pub fn set_streaming_mode(&self, mode: StreamingMode) {
        self.update(|flags| flags.streaming_mode = mode);
    }

    pub fn toggle_openai_reasoning(&self) -> bool {
        self.update(|flags| flags.openai_reasoning = !flags.openai_reasoning)
            .openai_reasoning
    }

    pub fn toggle_native_reasoning(&self) -> bool {
        self.update(|flags| flags.native_reasoning = !flags.native_reasoning)
            .native_reasoning
    }

    pub fn toggle_redirect_25_to_30(&self) -> bool {
        self.update(|flags| flags.redirect_25_to_30 = !flags.redirect_25_to_30)
            .redirect_25_to_30
    }

    pub fn set_resume_limit(&self, limit: u32) {
        self.update(|flags| {
            flags.resume_limit = limit;
            flags.enable_resume = limit > 0;
        });
    }

    fn update(&self, apply: impl Fn(&mut RuntimeFlags)) -> Arc<RuntimeFlags> {
        self.inner.rcu(|current| {
            let mut next = RuntimeFlags::clone(current);
            apply(&mut next);
            Arc::new(next)
        });
        self.inner.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggles_are_involutions() {
        let flags = FlagStore::new(StreamingMode::Real);
        assert!(flags.toggle_openai_reasoning());
        assert!(!flags.toggle_openai_reasoning());
        assert!(flags.toggle_redirect_25_to_30());
        assert!(!flags.toggle_redirect_25_to_30());
    }

    #[test]
    fn resume_limit_drives_enable_flag() {
        let flags = FlagStore::new(StreamingMode::Fake);
        flags.set_resume_limit(3);
        let snapshot = flags.snapshot();
        assert_eq!(snapshot.resume_limit, 3);
        assert!(snapshot.enable_resume);

        flags.set_resume_limit(0);
        assert!(!flags.snapshot().enable_resume);
    }
}
