//! Single-turn prompt against a locally hosted OpenAI-compatible server,
//! printing text deltas as they stream in.

use open_agent::{Agent, AgentEvent, AgentOptions, AssistantStreamEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let options = AgentOptions::builder()
        .system_prompt("You are a helpful assistant")
        .model("qwen2.5-32b-instruct")
        .base_url("http://localhost:1234/v1")
        .build()?;

    let agent = Agent::new(options);
    let mut events = agent.subscribe();
    agent.prompt("What's the capital of France?").await?;

    while let Ok(event) = events.recv().await {
        match event {
            AgentEvent::MessageUpdate(AssistantStreamEvent::TextDelta { delta }) => {
                print!("{delta}");
            }
            AgentEvent::AgentEnd => break,
            AgentEvent::Error(message) => {
                eprintln!("agent error: {message}");
                break;
            }
            _ => {}
        }
    }
    println!();

    Ok(())
}
