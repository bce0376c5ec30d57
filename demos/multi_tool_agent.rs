//! An agent with two tools (a calculator and a clock), auto-executed as
//! they're called, demonstrating the concurrent tool-dispatch path.

use open_agent::{Agent, AgentEvent, AgentOptions, Error, tool};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let calculator = tool("calculator", "Evaluate a basic arithmetic expression")
        .param("a", "number")
        .param("b", "number")
        .param("operation", "string")
        .build(|args| async move {
            let a = args["a"].as_f64().ok_or_else(|| Error::tool("missing 'a'"))?;
            let b = args["b"].as_f64().ok_or_else(|| Error::tool("missing 'b'"))?;
            let result = match args["operation"].as_str().unwrap_or("add") {
                "add" => a + b,
                "subtract" => a - b,
                "multiply" => a * b,
                "divide" if b != 0.0 => a / b,
                "divide" => return Err(Error::tool("division by zero")),
                other => return Err(Error::tool(format!("unknown operation: {other}"))),
            };
            Ok(json!({ "result": result }))
        });

    let clock = tool("current_time", "Returns the current UTC time").build(|_args| async move {
        Ok(json!({ "time": chrono::Utc::now().to_rfc3339() }))
    });

    let options = AgentOptions::builder()
        .system_prompt("You are a helpful assistant with access to tools.")
        .model("qwen2.5-32b-instruct")
        .base_url("http://localhost:1234/v1")
        .tool(calculator)
        .tool(clock)
        .build()?;

    let agent = Agent::new(options);
    let mut events = agent.subscribe();
    agent
        .prompt("What's 12 times 7, and what time is it?")
        .await?;

    while let Ok(event) = events.recv().await {
        match event {
            AgentEvent::ToolExecutionStart { tool_name, args, .. } => {
                println!("-> calling {tool_name}({args})");
            }
            AgentEvent::ToolExecutionEnd {
                tool_name,
                result,
                is_error,
                ..
            } => {
                println!("<- {tool_name} returned ({is_error}): {result}");
            }
            AgentEvent::MessageEnd(message) => {
                println!("turn finished: {message:?}");
            }
            AgentEvent::AgentEnd => break,
            _ => {}
        }
    }

    Ok(())
}
