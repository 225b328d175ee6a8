use anyhow::Result;
use loom_core::{Priority, Request};
use loom_gateway::Gateway;

pub async fn run(
    gateway: &Gateway,
    prompt: String,
    provider: Option<String>,
    session_class: Option<String>,
) -> Result<()> {
    let mut request = Request::new(prompt);
    request.policy.preferred_provider = provider;
    request.policy.session_class = session_class;
    request.policy.priority = Priority::Balanced;

    let response = gateway.generate(request).await?;

    println!("provider: {}", response.meta.provider);
    println!("model: {}", response.model);
    if response.meta.degraded {
        println!("degraded: true");
    }
    println!("tokens: {} prompt + {} completion", response.usage.prompt_tokens, response.usage.completion_tokens);
    println!();
    println!("{}", response.content);

    Ok(())
}
