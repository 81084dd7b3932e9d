mod settings;

use std::io::Write as _;
use std::sync::Arc;

use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};

use banter_engine::{ChatEngine, ChatMessage, EngineError};
use banter_llm::RigBackendFactory;
use banter_storage::{
    API_KEY_PREFERENCE, ConversationRecord, ConversationStore, MODEL_PREFERENCE, PreferenceStore,
    SqliteStore, StorageError,
};

use crate::settings::{ClientSettings, SettingsError, SettingsStore};

const DATABASE_FILE_NAME: &str = "banter.db";

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("settings error: {source}"))]
    Settings { source: SettingsError },
    #[snafu(display("storage error: {source}"))]
    Storage { source: StorageError },
    #[snafu(display("engine error: {source}"))]
    Engine { source: EngineError },
    #[snafu(display("failed to read input: {source}"))]
    Stdin { source: std::io::Error },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(error) = run().await {
        tracing::error!(error = %error, "fatal error");
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let settings_store = SettingsStore::load();
    let settings = settings_store.settings();

    let database_path = SettingsStore::default_config_dir().join(DATABASE_FILE_NAME);
    let storage = Arc::new(
        SqliteStore::open(&database_path.display().to_string())
            .await
            .context(StorageSnafu)?,
    );

    // Seed preferences from the settings file; the engine observes the
    // preference store, not the file.
    if !settings.api_key.is_empty() {
        storage
            .set_preference(API_KEY_PREFERENCE, &settings.api_key)
            .await
            .context(StorageSnafu)?;
    }
    storage
        .set_preference(MODEL_PREFERENCE, &settings.model)
        .await
        .context(StorageSnafu)?;

    let factory = Arc::new(RigBackendFactory::new(settings.endpoint.clone()));
    let engine = ChatEngine::spawn(storage.clone(), factory);

    if settings.api_key.is_empty() {
        println!("No API key configured. Set one with `:key <value>`.");
    }
    print_help();

    repl(&engine, &storage, &settings_store).await?;

    engine.dispose();
    Ok(())
}

async fn repl(
    engine: &ChatEngine,
    storage: &Arc<SqliteStore>,
    settings_store: &SettingsStore,
) -> Result<(), CliError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    prompt();
    while let Some(line) = lines.next_line().await.context(StdinSnafu)? {
        let line = line.trim();
        if line.is_empty() {
            prompt();
            continue;
        }

        if let Some(command) = line.strip_prefix(':') {
            if !handle_command(command, engine, storage, settings_store).await? {
                break;
            }
        } else {
            send_and_stream(engine, line).await?;
        }
        prompt();
    }

    Ok(())
}

/// Returns false when the REPL should exit.
async fn handle_command(
    command: &str,
    engine: &ChatEngine,
    storage: &Arc<SqliteStore>,
    settings_store: &SettingsStore,
) -> Result<bool, CliError> {
    let (verb, argument) = match command.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (command, ""),
    };

    match verb {
        "quit" | "q" => return Ok(false),
        "help" => print_help(),
        "reset" => {
            engine.reset_conversation().await.context(EngineSnafu)?;
            println!("Conversation reset.");
        }
        "stop" => {
            engine.stop().await.context(EngineSnafu)?;
            println!("Session stopped; send a message to continue.");
        }
        "text" => println!("{}", engine.conversation_text()),
        "save" => match engine.save_conversation(argument).await {
            Ok(id) => println!("Saved as \"{argument}\" ({id})."),
            Err(error) => println!("Could not save: {error}"),
        },
        "list" => {
            let conversations = storage.watch_conversations().borrow().clone();
            if conversations.is_empty() {
                println!("No saved conversations.");
            }
            for (index, conversation) in conversations.iter().enumerate() {
                println!("{index}: {}", conversation.name);
            }
        }
        "load" => match lookup_conversation(storage, argument) {
            Some(record) => {
                let name = record.name.clone();
                engine.load_conversation(record).await.context(EngineSnafu)?;
                println!("Loaded \"{name}\".");
            }
            None => println!("No conversation at index '{argument}'. Try `:list`."),
        },
        "delete" => match lookup_conversation(storage, argument) {
            Some(record) => {
                let name = record.name.clone();
                engine
                    .delete_conversation(record)
                    .await
                    .context(EngineSnafu)?;
                println!("Deleted \"{name}\".");
            }
            None => println!("No conversation at index '{argument}'. Try `:list`."),
        },
        "key" => {
            update_settings(settings_store, |settings| {
                settings.api_key = argument.to_string();
            })?;
            storage
                .set_preference(API_KEY_PREFERENCE, argument)
                .await
                .context(StorageSnafu)?;
            println!("API key updated.");
        }
        "model" => {
            update_settings(settings_store, |settings| {
                settings.model = argument.to_string();
            })?;
            storage
                .set_preference(MODEL_PREFERENCE, argument)
                .await
                .context(StorageSnafu)?;
            println!("Model set to '{argument}'.");
        }
        other => println!("Unknown command ':{other}'. Try `:help`."),
    }

    Ok(true)
}

fn update_settings(
    settings_store: &SettingsStore,
    apply: impl FnOnce(&mut ClientSettings),
) -> Result<(), CliError> {
    let mut settings = (*settings_store.settings()).clone();
    apply(&mut settings);
    settings_store.update(settings).context(SettingsSnafu)
}

fn lookup_conversation(storage: &Arc<SqliteStore>, argument: &str) -> Option<ConversationRecord> {
    let index: usize = argument.parse().ok()?;
    storage.watch_conversations().borrow().get(index).cloned()
}

/// Sends a prompt and prints reply text as it streams, by diffing the
/// loading message against what was already written.
async fn send_and_stream(engine: &ChatEngine, text: &str) -> Result<(), CliError> {
    let mut snapshots = engine.subscribe();
    engine.send_message(text, None).await.context(EngineSnafu)?;

    let mut printed = 0usize;
    loop {
        let done = {
            let snapshot = snapshots.borrow_and_update();
            if let Some(ChatMessage::Model(model)) = snapshot.messages.last() {
                let reply = model.text();
                if reply.len() > printed {
                    print!("{}", &reply[printed..]);
                    let _ = std::io::stdout().flush();
                    printed = reply.len();
                }
            }
            snapshot.can_send_message
        };

        if done {
            break;
        }
        if snapshots.changed().await.is_err() {
            break;
        }
    }

    println!();
    Ok(())
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

fn print_help() {
    println!(
        "Commands: :save <name>, :list, :load <n>, :delete <n>, :reset, :text, \
         :key <value>, :model <value>, :stop, :quit. Anything else is sent to the model."
    );
}
