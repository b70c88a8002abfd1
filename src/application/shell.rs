use crate::application::orchestrator::Orchestrator;
use crate::infrastructure::model::ModelProvider;
use thiserror::Error;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("stdin/stdout I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Interactive query loop. Each line is one query; `quit` (case-insensitive)
/// or end of input terminates. An in-flight query always runs to completion;
/// quit is only honored between queries. Query failures are reported and the
/// loop returns to the prompt.
pub async fn run<P>(orchestrator: &Orchestrator<P>) -> Result<(), ShellError>
where
    P: ModelProvider,
{
    let stdin = BufReader::new(io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = io::stdout();

    stdout
        .write_all(b"\nMCP client started.\nType your queries or 'quit' to exit.\n")
        .await?;
    stdout.flush().await?;

    loop {
        stdout.write_all(b"\nQuery: ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            info!("input closed; leaving chat loop");
            break;
        };
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if query.eq_ignore_ascii_case("quit") {
            info!("quit requested");
            break;
        }

        match orchestrator.run(query).await {
            Ok(answer) => {
                stdout.write_all(b"\n").await?;
                stdout.write_all(answer.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
            Err(err) => {
                // Fatal for this query only; the prompt comes back.
                error!(error = %err, "query failed");
                stdout
                    .write_all(format!("\nError: {err}\n").as_bytes())
                    .await?;
                stdout.flush().await?;
            }
        }
    }

    Ok(())
}
