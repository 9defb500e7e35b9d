use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info};

use sqlsession::config::Config;
use sqlsession::{CallerId, ConnectParams, ExecMode, SqlContext, SqlSessionError};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(config.log_level.clone())
        .with_writer(std::io::stderr)
        .init();

    info!("sqlsession v{}", env!("CARGO_PKG_VERSION"));

    let context = SqlContext::new();
    context.configure("defaultconnection", &config.connection_aspect())?;
    context.configure("connectionpool", &config.pool_aspect())?;

    let caller = CallerId::new(config.caller.clone());
    context.connect(&caller, ConnectParams::Pooled).await?;
    info!("Connected as {} to {}", caller, config.database);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let output = if let Some(command) = line.strip_prefix('\\') {
            match meta_command(&context, &caller, command).await {
                Ok(Some(output)) => output,
                Ok(None) => break,
                Err(e) => report(&e),
            }
        } else {
            match run_statement(&context, &caller, line).await {
                Ok(output) => output,
                Err(e) => report(&e),
            }
        };

        stdout.write_all(output.as_bytes()).await?;
        stdout.flush().await?;
    }

    context.shutdown().await;
    Ok(())
}

async fn run_statement(context: &SqlContext, caller: &CallerId, sql: &str) -> sqlsession::Result<String> {
    let has_cursor = context.execute(caller, sql, Vec::new(), ExecMode::Direct).await?;
    if !has_cursor {
        let count = context.row_count(caller).await?.unwrap_or(0);
        return Ok(format!("{count} row(s) affected\n"));
    }

    let mut output = context.column_names(caller).await?.join("\t");
    output.push('\n');
    for row in context.fetch_all(caller).await? {
        let fields: Vec<String> = row.iter().map(ToString::to_string).collect();
        output.push_str(&fields.join("\t"));
        output.push('\n');
    }
    Ok(output)
}

/// Returns `None` when the shell should exit
async fn meta_command(
    context: &SqlContext,
    caller: &CallerId,
    command: &str,
) -> sqlsession::Result<Option<String>> {
    let mut words = command.split_whitespace();
    let output = match (words.next(), words.next()) {
        (Some("quit" | "q"), _) => return Ok(None),
        (Some("begin"), _) => {
            context.start_transaction(caller).await?;
            "transaction started\n".to_string()
        }
        (Some("commit"), _) => {
            context.commit(caller).await?;
            "committed\n".to_string()
        }
        (Some("rollback"), _) => {
            context.rollback(caller).await?;
            "rolled back\n".to_string()
        }
        (Some("autocommit"), Some("on")) => {
            context.autocommit_on(caller).await?;
            "autocommit on\n".to_string()
        }
        (Some("autocommit"), Some("off")) => {
            context.autocommit_off(caller).await?;
            "autocommit off\n".to_string()
        }
        (Some("status"), _) => {
            let autocommit = context.autocommit_enabled(caller).await?;
            let connection = match context.connection_id(caller).await {
                Some(id) => format!("connection {id}"),
                None => "no physical connection".to_string(),
            };
            let pool = match context.pool_status() {
                Some(stats) => format!(
                    "pool {}/{} in use, {} idle",
                    stats.in_use, stats.capacity, stats.idle
                ),
                None => "no pool".to_string(),
            };
            format!(
                "caller {caller}: {connection}, autocommit {}, database {}, {pool}\n",
                if autocommit { "on" } else { "off" },
                context.current_database(caller).await?,
            )
        }
        _ => format!("unknown command: \\{command}\n"),
    };
    Ok(Some(output))
}

fn report(err: &SqlSessionError) -> String {
    error!("{}", err);
    format!("ERROR {}: {}\n", err.error_code(), err)
}
