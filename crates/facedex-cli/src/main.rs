use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::multipart::{Form, Part};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facedex", about = "facedex face registry CLI")]
struct Cli {
    /// Base URL of the facedexd HTTP API
    #[arg(long, global = true, env = "FACEDEX_URL", default_value = "http://127.0.0.1:5000")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the most prominent face in an image under a name
    Register {
        /// Display name; registering an existing name adds another sample
        #[arg(short, long)]
        name: String,
        /// Image file (JPEG, PNG, ...)
        image: PathBuf,
    },
    /// Identify every face in an image
    Recognize {
        image: PathBuf,
    },
    /// List registered people with their stored embeddings
    Entries,
    /// Ask a question about the registration log
    Chat {
        /// e.g. "who was last registered"
        message: String,
    },
    /// Show daemon status
    Status,
}

/// Join `path` onto the base URL, tolerating a trailing slash.
fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

async fn image_form(image: &Path) -> Result<Form> {
    let bytes = tokio::fs::read(image)
        .await
        .with_context(|| format!("reading {}", image.display()))?;
    let file_name = image
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    Ok(Form::new().part("file", Part::bytes(bytes).file_name(file_name)))
}

/// Decode the JSON body, turning non-2xx statuses into errors.
async fn read_json(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body = response.text().await.context("reading response body")?;
    let value: Value = serde_json::from_str(&body)
        .with_context(|| format!("daemon returned non-JSON body ({status}): {body}"))?;
    if !status.is_success() {
        let message = value["error"].as_str().unwrap_or(&body);
        bail!("{status}: {message}");
    }
    Ok(value)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let url = |path: &str| endpoint(&cli.url, path);

    let request = match &cli.command {
        Commands::Register { name, image } => {
            let form = image_form(image).await?.text("name", name.clone());
            client.post(url("/register")).multipart(form)
        }
        Commands::Recognize { image } => {
            client.post(url("/recognize")).multipart(image_form(image).await?)
        }
        Commands::Entries => client.get(url("/entries")),
        Commands::Chat { message } => client.post(url("/chat")).json(&json!({ "message": message })),
        Commands::Status => client.get(url("/health")),
    };

    tracing::debug!(url = %cli.url, "sending request");
    let response = request
        .send()
        .await
        .with_context(|| format!("facedexd not reachable at {}", cli.url))?;
    let body = read_json(response).await?;

    match &cli.command {
        Commands::Chat { .. } => match body["answer"].as_str() {
            Some(answer) => println!("{answer}"),
            None => println!("{}", serde_json::to_string_pretty(&body)?),
        },
        _ => println!("{}", serde_json::to_string_pretty(&body)?),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_endpoint_join() {
        assert_eq!(endpoint("http://h:5000", "/entries"), "http://h:5000/entries");
        assert_eq!(endpoint("http://h:5000/", "/entries"), "http://h:5000/entries");
        assert_eq!(endpoint("http://h:5000/", "chat"), "http://h:5000/chat");
    }

    #[test]
    fn test_register_args() {
        let cli = Cli::try_parse_from([
            "facedex", "--url", "http://x", "register", "--name", "Alice", "a.jpg",
        ])
        .unwrap();
        assert_eq!(cli.url, "http://x");
        match cli.command {
            Commands::Register { name, image } => {
                assert_eq!(name, "Alice");
                assert_eq!(image, PathBuf::from("a.jpg"));
            }
            _ => panic!("expected register"),
        }
    }

    #[test]
    fn test_register_requires_name() {
        assert!(Cli::try_parse_from(["facedex", "register", "a.jpg"]).is_err());
    }
}
