use std::any::Any;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::anyhow;
use clap::Parser;
use pdf_timestamp::incremental::DEFAULT_TOKEN_SIZE;
use pdf_timestamp::{Error, PdfTimestamper, DEFAULT_INPUT, DEFAULT_OUTPUT, DEFAULT_TSA_URL};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "pdf-timestamp",
    version,
    about = "Apply an RFC 3161 document timestamp to a PDF",
    long_about = "Requests a timestamp token from a Time-Stamp Authority over the digest of a PDF \
                  and appends it to the document as an incremental update."
)]
struct Cli {
    /// PDF file to timestamp
    #[arg(default_value = DEFAULT_INPUT)]
    input: PathBuf,

    /// Where to write the timestamped PDF (replaced if it exists)
    #[arg(default_value = DEFAULT_OUTPUT)]
    output: PathBuf,

    /// RFC 3161 Time-Stamp Authority endpoint
    #[arg(long, env = "PDF_TSA_URL", default_value = DEFAULT_TSA_URL)]
    tsa_url: String,

    /// Digest algorithm: sha256, sha384 or sha512
    #[arg(long, default_value = "sha256")]
    digest: String,

    /// Bytes reserved in the document for the timestamp token
    #[arg(long, default_value_t = DEFAULT_TOKEN_SIZE)]
    token_size: usize,

    /// Log debug events (ignored if RUST_LOG is set)
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = catch_panic(|| run(&cli));
    if let Err(e) = &result {
        match e {
            Error::FileNotFound(path) => {
                tracing::error!(path = %path.display(), "file not found")
            }
            Error::Timestamping(cause) => tracing::error!(%cause, "timestamping failed"),
            Error::Unexpected(cause) => tracing::error!(error = ?cause, "unexpected error"),
        }
    }

    let status = finish(&cli, &result, &mut std::io::stdout(), &mut std::io::stderr());
    ExitCode::from(status)
}

fn run(cli: &Cli) -> Result<(), Error> {
    let timestamper = PdfTimestamper::new(Some(&cli.tsa_url))?.with_token_size(cli.token_size);
    timestamper.timestamp(&cli.input, &cli.output, &cli.digest)
}

/// Turns a panic inside `f` into [`Error::Unexpected`].
fn catch_panic(f: impl FnOnce() -> Result<(), Error>) -> Result<(), Error> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(Error::Unexpected(anyhow!(panic_message(&*payload)))))
}

/// Prints the summary or the error, and returns the process exit status.
fn finish(
    cli: &Cli,
    result: &Result<(), Error>,
    stdout: &mut impl Write,
    stderr: &mut impl Write,
) -> u8 {
    // Write errors are ignored.
    let _ = match result {
        Ok(()) => summary(cli, stdout),
        Err(e) => report(e, stderr),
    };

    match result {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn summary(cli: &Cli, out: &mut impl Write) -> io::Result<()> {
    writeln!(out, "\n✓ Document successfully timestamped!")?;
    writeln!(out, "  Input:  {}", cli.input.display())?;
    writeln!(out, "  Output: {}", cli.output.display())
}

fn report(error: &Error, out: &mut impl Write) -> io::Result<()> {
    match error {
        Error::Unexpected(cause) => writeln!(out, "\n✗ Unexpected error: {cause}")?,
        _ => writeln!(out, "\n✗ Error: {error}")?,
    }

    let mut source = std::error::Error::source(error);
    if source.is_some() {
        writeln!(out, "\n  Caused by:")?;
    }
    while let Some(cause) = source {
        writeln!(out, "    - {cause}")?;
        source = cause.source();
    }
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}
