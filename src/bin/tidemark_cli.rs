//! One-shot query tool for a Tidemark server.
//!
//! Loads the standard client configuration, applies command-line overrides,
//! runs a single query, and prints the result rows.

#![expect(clippy::print_stdout, reason = "command-line output")]

use anyhow::Context;
use clap::Parser;
use tidemark::{
    Client,
    ClientConfig,
    RecordSet,
    schema::{FieldType, RecordTypeDefinition},
};

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Server host (overrides configuration).
    #[arg(long)]
    host: Option<String>,

    /// Server port (overrides configuration).
    #[arg(long)]
    port: Option<u16>,

    /// Database to select before running the query.
    #[arg(long)]
    database: Option<String>,

    /// Query text to execute.
    query: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ClientConfig::load().context("loading configuration")?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let client = Client::connect(&config).await.context("connecting")?;
    if let Some(database) = &cli.database {
        client
            .database(database)
            .await
            .context("selecting database")?;
    }

    let mut rows = client.execute(&cli.query).await.context("executing query")?;
    let definition = rows.definition().clone();
    let mut count = 0usize;
    while rows.advance().await.context("reading records")? {
        let type_index = rows.record_type().context("reading record type")?;
        let record_type = definition
            .record_type(type_index)
            .context("resolving record type")?;
        println!("{}", format_row(&rows, record_type).context("formatting record")?);
        count += 1;
    }
    rows.close();
    println!("{count} record(s)");

    client.close().await;
    Ok(())
}

fn format_row(rows: &RecordSet, record_type: &RecordTypeDefinition) -> anyhow::Result<String> {
    let mut line = record_type.name().to_owned();
    for (index, field) in record_type.fields().iter().enumerate() {
        let rendered = match field.field_type {
            FieldType::Timestamp(unit) => rows.get_timestamp_in(index, unit)?.to_string(),
            FieldType::Long => rows.get_long(index)?.to_string(),
            FieldType::Int => rows.get_int(index)?.to_string(),
            FieldType::Byte => rows.get_byte(index)?.to_string(),
            FieldType::Double => rows.get_double(index)?.to_string(),
            FieldType::Decimal => format!(
                "{}e{}",
                rows.get_decimal_mantissa(index)?,
                rows.get_decimal_exponent(index)?
            ),
        };
        line.push_str(&format!(" {}={rendered}", field.name));
    }
    Ok(line)
}
