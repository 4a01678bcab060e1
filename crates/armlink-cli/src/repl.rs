//! Console chat – talk to the path planner without a gateway client.
//!
//! Each line goes through the same [`ConversationManager`] the gateway uses
//! (priming turn, few-shot examples, truncation, trajectory sink).
//!
//! Supported slash-commands:
//!   /history      – print the conversation so far
//!   /help         – show this list
//!   /quit | /exit – leave the chat
//!
//! A line containing "goodbye" is sent like any other and ends the session
//! once the reply has been printed.

use std::sync::Arc;

use armlink_runtime::{ConversationError, ConversationManager, Role, SubmitOutcome};
use colored::Colorize;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio_util::sync::CancellationToken;

/// One line of console input, interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChatInput {
    Empty,
    Help,
    History,
    Quit,
    Unknown(String),
    Prompt(String),
    /// A prompt after which the session ends.
    Farewell(String),
}

pub(crate) fn parse_input(line: &str) -> ChatInput {
    let line = line.trim();
    match line {
        "" => ChatInput::Empty,
        "/help" => ChatInput::Help,
        "/history" => ChatInput::History,
        "/quit" | "/exit" => ChatInput::Quit,
        cmd if cmd.starts_with('/') => ChatInput::Unknown(cmd.to_string()),
        text if text.to_lowercase().contains("goodbye") => ChatInput::Farewell(text.to_string()),
        text => ChatInput::Prompt(text.to_string()),
    }
}

/// Run the chat loop until the user leaves, stdin closes or `cancel` fires.
pub async fn run(manager: Arc<ConversationManager>, cancel: CancellationToken) -> Result<(), String> {
    let mut editor =
        DefaultEditor::new().map_err(|e| format!("Failed to open the line editor: {e}"))?;

    println!(
        "  Chatting with the path planner.  Trajectories go to {}.",
        manager.sink().path().display().to_string().bold()
    );
    println!("  Type {} for commands.\n", "/help".bold().cyan());

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let (returned, read) = tokio::task::spawn_blocking(move || {
            let read = editor.readline("User: ");
            (editor, read)
        })
        .await
        .map_err(|e| format!("Line editor task failed: {e}"))?;
        editor = returned;

        let line = match read {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}: {e}", "Read error".red());
                break;
            }
        };
        let _ = editor.add_history_entry(line.as_str());

        match parse_input(&line) {
            ChatInput::Empty => {}
            ChatInput::Help => print_help(),
            ChatInput::History => print_history(&manager).await,
            ChatInput::Quit => break,
            ChatInput::Unknown(cmd) => println!(
                "{} '{}'. Type {} for available commands.",
                "Unknown command:".red(),
                cmd.yellow(),
                "/help".bold()
            ),
            ChatInput::Prompt(text) => {
                send(&manager, &text, &cancel).await;
            }
            ChatInput::Farewell(text) => {
                send(&manager, &text, &cancel).await;
                break;
            }
        }
    }

    println!("{}", "Goodbye.".green());
    Ok(())
}

async fn send(manager: &ConversationManager, text: &str, cancel: &CancellationToken) {
    let outcome = tokio::select! {
        _ = cancel.cancelled() => return,
        outcome = manager.submit(text) => outcome,
    };
    match outcome {
        Ok(SubmitOutcome::Written { path, bytes }) => {
            print_last_reply(manager).await;
            println!(
                "  {} {} bytes written to {}",
                "✓".green().bold(),
                bytes,
                path.display()
            );
        }
        Ok(SubmitOutcome::NoPayload { reply }) => {
            print_reply(&reply);
            println!("  {}", "No JSON block in the reply; nothing written.".yellow());
        }
        Err(ConversationError::Llm(e)) => println!("{}: {e}", "Model request failed".red()),
        Err(ConversationError::Sink(e)) => println!("{}: {e}", "Could not save trajectory".red()),
    }
}

fn print_reply(reply: &str) {
    println!("{} {}", "Planner:".bold(), reply.green());
}

async fn print_last_reply(manager: &ConversationManager) {
    let history = manager.history().await;
    if let Some(turn) = history.turns().last()
        && turn.role == Role::Assistant
    {
        print_reply(&turn.content);
    }
}

async fn print_history(manager: &ConversationManager) {
    let history = manager.history().await;
    println!();
    println!("{}", "Conversation".bold().underline());
    for turn in history.turns() {
        let tag = match turn.role {
            Role::System => "system".dimmed(),
            Role::User => "user".cyan().bold(),
            Role::Assistant => "assistant".green().bold(),
        };
        println!("  [{tag}] {}", turn.content);
    }
    println!();
}

fn print_help() {
    println!();
    println!("{}", "Chat Commands".bold().underline());
    println!("  {}     – print the conversation so far", "/history".bold().cyan());
    println!("  {}  – leave the chat", "/quit  /exit".bold().cyan());
    println!("  Anything else is sent to the planner.  Saying goodbye ends the chat.");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_commands() {
        assert_eq!(parse_input("/history"), ChatInput::History);
        assert_eq!(parse_input(" /quit "), ChatInput::Quit);
        assert_eq!(parse_input("/exit"), ChatInput::Quit);
        assert_eq!(parse_input("/help"), ChatInput::Help);
        assert_eq!(parse_input("/models"), ChatInput::Unknown("/models".into()));
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert_eq!(parse_input(""), ChatInput::Empty);
        assert_eq!(parse_input("   \t"), ChatInput::Empty);
    }

    #[test]
    fn goodbye_is_case_insensitive_and_still_sent() {
        assert_eq!(
            parse_input("OK, Goodbye for now"),
            ChatInput::Farewell("OK, Goodbye for now".into())
        );
        assert_eq!(
            parse_input("draw a circle"),
            ChatInput::Prompt("draw a circle".into())
        );
    }
}
