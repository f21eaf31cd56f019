//! Command-line interface for agent-rs
//!
//! Registers a few demo agents on a single-threaded runtime, sends one message
//! and prints the reply.

use agent_core::{Agent, AgentId, Handlers, MessageContext, Metadata};
use agent_runtime::{SendOptions, SingleThreadedAgentRuntime};
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "agent-cli")]
#[command(about = "Send a message through the agent-rs runtime", long_about = None)]
struct Args {
    /// Text to send
    #[arg(short, long, default_value = "hello")]
    message: String,

    /// Agent to address
    #[arg(short, long, value_enum, default_value_t = Target::Echo)]
    target: Target,

    /// Instance key of the addressed agent
    #[arg(short, long, default_value = "default")]
    key: String,

    /// Number of times to send the message
    #[arg(short, long, default_value_t = 1)]
    repeat: usize,

    /// Session id attached to every send
    #[arg(long)]
    session: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Target {
    /// Replies with the input
    Echo,
    /// Forwards to `echo/<key>` and returns its reply
    Relay,
    /// Replies with how many messages it has seen
    Counter,
}

impl Target {
    fn agent_type(self) -> &'static str {
        match self {
            Self::Echo => "echo",
            Self::Relay => "relay",
            Self::Counter => "counter",
        }
    }
}

struct Echo;

impl Agent for Echo {
    fn handlers(&self) -> Handlers<Self> {
        Handlers::new().on(|_agent, message: String, _ctx| async move { Ok(message) })
    }

    fn description(&self) -> &str {
        "Replies with the input"
    }
}

struct Relay {
    target: AgentId,
}

impl Agent for Relay {
    fn handlers(&self) -> Handlers<Self> {
        Handlers::new().on(|agent: Arc<Self>, message: String, ctx: MessageContext| async move {
            info!("{} relaying to {}", ctx.recipient(), agent.target);
            let reply: String = ctx.send_message(message, &agent.target).await?;
            Ok(reply)
        })
    }

    fn description(&self) -> &str {
        "Forwards to the echo agent with the same key"
    }
}

#[derive(Default)]
struct Counter {
    seen: AtomicUsize,
}

impl Agent for Counter {
    fn handlers(&self) -> Handlers<Self> {
        Handlers::new().on(|agent: Arc<Self>, message: String, _ctx| async move {
            let seen = agent.seen.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("{message} (#{seen})"))
        })
    }

    fn description(&self) -> &str {
        "Counts the messages it receives"
    }
}

fn build_runtime(name: &str) -> anyhow::Result<SingleThreadedAgentRuntime> {
    let runtime = SingleThreadedAgentRuntime::builder().name(name).build();
    runtime.register_agent_type("echo", |_id: &AgentId| Echo)?;
    // Keys are already validated, so the echo id is too.
    runtime.register_agent_type("relay", |id: &AgentId| Relay {
        target: AgentId::new("echo", id.key()).unwrap_or_else(|_| id.clone()),
    })?;
    runtime.register_agent_type("counter", |_id: &AgentId| Counter::default())?;
    Ok(runtime)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = agent_utils::Config::from_env()?;
    agent_utils::init_tracing(&config)?;

    let args = Args::parse();
    info!("Starting {} ({})", config.app_name, config.environment);

    let runtime = build_runtime(&config.app_name)?;
    runtime.start();

    let recipient = AgentId::new(args.target.agent_type(), &args.key)?;
    let mut metadata = Metadata::new();
    if let Some(session) = &args.session {
        metadata = metadata.with_session_id(session.clone());
    }

    for _ in 0..args.repeat {
        let options = SendOptions::new()
            .with_sender(AgentId::new("cli", "user")?)
            .with_metadata(metadata.clone());
        let reply: String = runtime
            .send_message_with(args.message.clone(), &recipient, options)
            .await?;
        println!("{recipient}: {reply}");
    }

    runtime.stop().await;
    info!("Live agents at shutdown: {:?}", runtime.agent_ids());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_relay_reaches_echo_with_same_key() {
        let runtime = build_runtime("test").unwrap();
        runtime.start();

        let reply: String = runtime
            .send_message("ping".to_string(), &AgentId::new("relay", "k").unwrap())
            .await
            .unwrap();
        assert_eq!(reply, "ping");
        assert_eq!(
            runtime.agent_ids(),
            vec![
                AgentId::new("echo", "k").unwrap(),
                AgentId::new("relay", "k").unwrap()
            ]
        );

        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_counter_keeps_state_per_key() {
        let runtime = build_runtime("test").unwrap();
        runtime.start();
        let a = AgentId::new("counter", "a").unwrap();
        let b = AgentId::new("counter", "b").unwrap();

        let _: String = runtime.send_message("x".to_string(), &a).await.unwrap();
        let second: String = runtime.send_message("x".to_string(), &a).await.unwrap();
        let other: String = runtime.send_message("x".to_string(), &b).await.unwrap();
        assert_eq!(second, "x (#2)");
        assert_eq!(other, "x (#1)");

        runtime.stop().await;
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from(["agent-cli", "-m", "hi", "-t", "relay", "-k", "x", "-r", "3"]);
        assert_eq!(args.message, "hi");
        assert!(matches!(args.target, Target::Relay));
        assert_eq!(args.key, "x");
        assert_eq!(args.repeat, 3);
    }
}
