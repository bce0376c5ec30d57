//! Lifecycle hooks: block a tool call, then rewrite a user prompt before
//! it reaches the model.

use open_agent::{Agent, AgentEvent, AgentOptions, HookDecision, Hooks, tool};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let delete_file = tool("delete_file", "Delete a file by path")
        .param("path", "string")
        .build(|args| async move { Ok(json!({ "deleted": args["path"] })) });

    let hooks = Hooks::new()
        .add_pre_tool_use(|event| async move {
            if event.tool_name == "delete_file" {
                return Some(HookDecision::block("destructive tools require confirmation"));
            }
            None
        })
        .add_user_prompt_submit(|event| async move {
            if event.prompt.trim().is_empty() {
                return Some(HookDecision::modify_prompt(
                    "(the user sent an empty message)",
                    "empty prompts are replaced with a placeholder",
                ));
            }
            None
        });

    let options = AgentOptions::builder()
        .system_prompt("You are a cautious file-management assistant.")
        .model("qwen2.5-32b-instruct")
        .base_url("http://localhost:1234/v1")
        .tool(delete_file)
        .hooks(hooks)
        .build()?;

    let agent = Agent::new(options);
    let mut events = agent.subscribe();
    agent.prompt("Please delete /tmp/scratch.txt").await?;

    while let Ok(event) = events.recv().await {
        match event {
            AgentEvent::ToolExecutionEnd {
                tool_name,
                result,
                is_error,
                ..
            } => println!("{tool_name} -> {result} (blocked: {is_error})"),
            AgentEvent::AgentEnd => break,
            _ => {}
        }
    }

    Ok(())
}
