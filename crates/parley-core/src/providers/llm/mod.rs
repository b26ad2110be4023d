use async_trait::async_trait;

/// Free text plus token usage from the external text-generation service.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        user_message: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> anyhow::Result<Completion>;
    fn provider_name(&self) -> &'static str;
}

pub mod fake;
pub mod openai;
