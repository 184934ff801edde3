use clap::Parser;
use colored::*;
use std::future::Future;
use std::io::Write;
use std::sync::{Arc, Mutex};
use streamchat::logging::{init_tracing, setup_panic_hook};
use streamchat::scheduler::RenderSink;
use streamchat::*;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};

/// Prints only what changed since the last render.
#[derive(Default)]
struct TerminalSink {
    shown: Mutex<String>,
}

impl RenderSink for TerminalSink {
    fn render(&self, content: &str, done: bool) {
        let mut shown = match self.shown.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut out = std::io::stdout().lock();

        if let Some(delta) = content.strip_prefix(shown.as_str()) {
            let _ = write!(out, "{}", delta);
        } else if content.is_empty() {
            let _ = write!(out, "\n{}", "[message discarded]".dimmed());
        } else {
            // terminal rewrite, e.g. the interruption notice
            let _ = write!(out, "\n{}", content.yellow());
        }
        if done {
            let _ = writeln!(out);
        }
        let _ = out.flush();

        shown.clear();
        shown.push_str(content);
    }
}

enum Command {
    New,
    History,
    Clear,
    Quit,
    Prompt(String),
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    match line {
        "" => None,
        "/new" => Some(Command::New),
        "/history" => Some(Command::History),
        "/clear" => Some(Command::Clear),
        "/quit" | "/exit" => Some(Command::Quit),
        _ => Some(Command::Prompt(line.to_string())),
    }
}

enum Input {
    Line(String),
    Closed,
    Interrupted,
}

/// Next input line, unless `interrupt` fires first.
async fn read_input<R, F>(lines: &mut Lines<R>, interrupt: F) -> Input
where
    R: AsyncBufRead + Unpin,
    F: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        line = lines.next_line() => match line {
            Ok(Some(line)) => Input::Line(line),
            Ok(None) => Input::Closed,
            Err(e) => {
                tracing::error!("Failed to read input: {}", e);
                Input::Closed
            }
        },
        r = interrupt => match r {
            Ok(()) => Input::Interrupted,
            Err(e) => {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
                Input::Closed
            }
        },
    }
}

fn print_prompt() {
    print!("{} ", ">".green().bold());
    let _ = std::io::stdout().flush();
}

async fn run_turn(state: &AppState, thread: &mut ChatThread, prompt: &str) -> Result<()> {
    let user_message = ChatMessage::user(thread.id().clone(), prompt);
    state.store.save(thread.id(), &user_message).await?;

    let controller = state.client.begin_turn();
    let cancel = controller.cancel_handle();
    let watcher = tokio::spawn(async move {
        tokio::select! {
            r = tokio::signal::ctrl_c() => {
                if r.is_ok() {
                    cancel.cancel();
                }
            }
            _ = cancel.cancelled() => {}
        }
    });

    let sink: Arc<dyn RenderSink> = Arc::new(TerminalSink::default());
    let result = state.client.submit(controller, thread, prompt, sink).await;
    watcher.abort();

    let outcome = result?;
    if let Some(message) = &outcome.message {
        if !message.content.is_empty() {
            let record = ChatMessage::from_assistant(thread.id().clone(), message);
            state.store.save(thread.id(), &record).await?;
        }
    }

    match outcome.state {
        StreamState::Cancelled => println!("{}", "(cancelled)".dimmed()),
        StreamState::Failed => {
            if let Some(err) = &outcome.error {
                eprintln!("{} {}", "stream failed:".red().bold(), err);
            }
            println!("{} {}", "last prompt:".dimmed(), outcome.prompt);
        }
        _ => {}
    }
    Ok(())
}

async fn show_history(state: &AppState, thread: &ChatThread) -> Result<()> {
    let messages = state.store.load(thread.id()).await?;
    if messages.is_empty() {
        println!("{}", "(no messages)".dimmed());
    }
    for message in messages {
        let label = match message.role {
            Role::User => "you".cyan().bold(),
            Role::Assistant => "assistant".magenta().bold(),
        };
        println!("{}: {}", label, message.content);
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let _guard = init_tracing(&args.log_dir);
    setup_panic_hook();

    let state = match AppState::build(args).await {
        Ok(state) => state,
        Err(e) => {
            eprintln!("Failed to start: {}", e.inner);
            std::process::exit(1);
        }
    };

    let mut thread = ChatThread::new(state.initial_thread());
    tracing::info!(
        "Starting streamchat (model: {}, endpoint: {}, thread: {})",
        state.client.config().model,
        state.client.config().endpoint,
        thread.id()
    );
    println!(
        "{} {} {}",
        "streamchat".bold(),
        state.client.config().model.cyan(),
        format!("thread {}", thread.id().short()).dimmed()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print_prompt();
        let line = match read_input(&mut lines, tokio::signal::ctrl_c()).await {
            Input::Line(line) => line,
            Input::Closed => break,
            Input::Interrupted => {
                println!();
                break;
            }
        };

        let Some(command) = parse_command(&line) else {
            continue;
        };
        let result = match command {
            Command::Quit => break,
            Command::New => {
                thread.switch_to(ThreadId::new());
                println!("{}", format!("thread {}", thread.id().short()).dimmed());
                Ok(())
            }
            Command::Clear => {
                thread.reset_context();
                state.store.delete(thread.id()).await
            }
            Command::History => show_history(&state, &thread).await,
            Command::Prompt(prompt) => run_turn(&state, &mut thread, &prompt).await,
        };

        if let Err(e) = result {
            tracing::error!("Command failed: {}", e);
            eprintln!("{} {}", "error:".red().bold(), e.inner);
        }
    }

    tracing::info!("Exiting streamchat");
}
