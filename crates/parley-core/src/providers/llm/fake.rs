use super::{Completion, CompletionClient};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

type CallHook = Box<dyn Fn(usize) + Send + Sync>;

/// Scripted completion client for tests. Replies are served in order; when
/// the script runs dry the last reply is repeated. An optional hook fires on
/// every call with the zero-based call index.
pub struct FakeClient {
    replies: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    calls: AtomicUsize,
    input_tokens: u64,
    output_tokens: u64,
    on_call: Option<CallHook>,
}

impl FakeClient {
    pub fn new(replies: Vec<&str>) -> Self {
        let last = replies.last().map(|s| s.to_string()).unwrap_or_default();
        Self {
            replies: Mutex::new(replies.into_iter().map(String::from).collect()),
            last: Mutex::new(last),
            calls: AtomicUsize::new(0),
            input_tokens: 100,
            output_tokens: 50,
            on_call: None,
        }
    }

    /// Fixed token usage reported on every completion.
    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self
    }

    pub fn with_hook(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_call = Some(Box::new(hook));
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionClient for FakeClient {
    async fn complete(
        &self,
        _system_prompt: &str,
        _user_message: &str,
        _max_tokens: u32,
        _temperature: f32,
    ) -> anyhow::Result<Completion> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = &self.on_call {
            hook(n);
        }
        let text = match self.replies.lock().unwrap().pop_front() {
            Some(t) => {
                *self.last.lock().unwrap() = t.clone();
                t
            }
            None => self.last.lock().unwrap().clone(),
        };
        Ok(Completion {
            text,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        })
    }

    fn provider_name(&self) -> &'static str {
        "fake"
    }
}

/// Client that always errors, for exercising the api_error path.
pub struct FailingClient;

#[async_trait]
impl CompletionClient for FailingClient {
    async fn complete(
        &self,
        _system_prompt: &str,
        _user_message: &str,
        _max_tokens: u32,
        _temperature: f32,
    ) -> anyhow::Result<Completion> {
        anyhow::bail!("provider unavailable")
    }

    fn provider_name(&self) -> &'static str {
        "failing"
    }
}
