use clap::Parser;
use prettytable::{row, Table};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use hbnb::{
    config::{CliArgs, Command, Config, LoggingConfig},
    open_storage, Entity, Storage, StorageError, TYPE_TAG,
};

fn main() {
    dotenvy::dotenv().ok();
    let cli = CliArgs::parse();

    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };
    init_tracing(&config.logging);

    if let Err(e) = run(&cli.command, &config) {
        tracing::error!(error = %e, "Command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
    }
}

fn run(command: &Command, config: &Config) -> Result<(), StorageError> {
    let storage = open_storage(&config.storage)?;

    match command {
        Command::Count { kind } => println!("{}", storage.count(kind.as_deref())?),
        Command::List { kind } => {
            let objects = storage.all(kind.as_deref())?;
            let mut table = Table::new();
            table.add_row(row!["Type", "Id", "Updated", "Fields"]);
            for entity in objects.values() {
                table.add_row(row![entity.kind(), entity.id(), entity.base().updated_at(), fields_of(entity)]);
            }
            table.printstd();
        }
        Command::Show { kind, id } => match storage.get(kind, id)? {
            Some(entity) => println!("{}", entity),
            None => println!("** no instance found **"),
        },
    }

    storage.close()
}

/// Type specific fields as compact JSON.
fn fields_of(entity: &Entity) -> String {
    let mut fields = entity.to_serializable(false);
    for key in [TYPE_TAG, "id", "created_at", "updated_at"] {
        fields.remove(key);
    }
    Value::Object(fields).to_string()
}
