//! `nestling ask`: Single-question mode.

use std::path::Path;

use clap::Args;
use nestling_core::chat::SessionId;
use nestling_core::child::{ChildId, UserId};
use nestling_gateway::Runtime;
use nestling_rag::ChatRequest;

#[derive(Debug, Args)]
pub struct AskArgs {
    /// The question
    pub question: String,

    /// Scope the answer to this child
    #[arg(long)]
    pub child: Option<ChildId>,

    /// Caller's user id; must be the child's guardian when --child is set
    #[arg(long, requires = "child")]
    pub user: Option<UserId>,

    /// Continue an existing session
    #[arg(long)]
    pub session: Option<String>,

    /// Override the configured chat model
    #[arg(long)]
    pub model: Option<String>,

    /// Turn number within the session; re-running with the same value records it once
    #[arg(long, requires = "session")]
    pub turn: Option<u64>,

    /// Print the full answer record as JSON
    #[arg(long)]
    pub raw: bool,
}

pub async fn run(config_path: Option<&Path>, args: AskArgs) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    super::require_api_key(&config)?;

    let runtime = Runtime::open(config).await?;
    let services = runtime.services();

    eprint!("  Thinking...");
    let result = services
        .pipeline
        .ask(ChatRequest {
            user_id: args.user.unwrap_or_default(),
            question: args.question,
            session_id: args.session.as_deref().map(SessionId::from),
            child_id: args.child,
            model: args.model,
            turn_sequence: args.turn,
        })
        .await;
    eprint!("\r              \r");
    runtime.shutdown().await;

    let answer = result?;
    if args.raw {
        println!("{}", serde_json::to_string_pretty(&answer)?);
        return Ok(());
    }

    println!("{}", answer.answer);
    println!();
    if !answer.citations.is_empty() {
        println!("  Sources: {}", answer.citations.join(", "));
    }
    if answer.context_limited {
        println!("  (answered with limited context)");
    }
    println!("  Session: {}", answer.session_id);
    Ok(())
}
