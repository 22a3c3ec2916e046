//! Mock source API
//!
//! Serves `GET /data?page={page}&size={size}` with `size` random records.
//! A missing, unparsable or non-positive `size` falls back to 1000. Ids are
//! drawn from `0..1_000_000`, so pages overlap and the pipeline sees
//! duplicates, the way a real upstream would.

use anyhow::Result;
use axum::{extract::Query, routing::get, Json, Router};
use clap::Parser;
use recsync_common::logging::{init_logging, LogConfig};
use recsync_common::Record;
use recsync_server::api::tracing_layer;
use serde::Deserialize;
use std::net::SocketAddr;
use tracing::info;
use uuid::Uuid;

const DEFAULT_PAGE_SIZE: usize = 1000;
const MAX_ID: u128 = 1_000_000;

const FIRST_NAMES: &[&str] = &[
    "Ada", "Alan", "Barbara", "Claude", "Donald", "Edsger", "Frances", "Grace", "John", "Ken",
    "Leslie", "Margaret", "Niklaus", "Radia", "Shafi", "Tony",
];
const LAST_NAMES: &[&str] = &[
    "Allen", "Backus", "Hamilton", "Hoare", "Hopper", "Knuth", "Lamport", "Liskov", "Lovelace",
    "McCarthy", "Perlman", "Ritchie", "Shannon", "Thompson", "Turing", "Wirth",
];
const DOMAINS: &[&str] = &["example.com", "example.net", "example.org", "mail.test"];

#[derive(Parser, Debug)]
#[command(name = "recsync-mock-source", about = "Serve random records for the sync pipeline")]
struct Args {
    #[arg(long, env = "MOCK_SOURCE_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, env = "MOCK_SOURCE_PORT", default_value_t = 8088)]
    port: u16,
}

#[derive(Debug, Deserialize)]
struct PageParams {
    page: Option<String>,
    size: Option<String>,
}

fn page_size(raw: Option<&str>) -> usize {
    raw.and_then(|s| s.parse::<i64>().ok())
        .filter(|size| *size >= 1)
        .map(|size| size as usize)
        .unwrap_or(DEFAULT_PAGE_SIZE)
}

fn pick<'a>(choices: &[&'a str], bits: u128) -> &'a str {
    choices[(bits % choices.len() as u128) as usize]
}

fn fake_record() -> Record {
    let bits = Uuid::new_v4().as_u128();
    let first = pick(FIRST_NAMES, bits >> 24);
    let last = pick(LAST_NAMES, bits >> 32);
    let domain = pick(DOMAINS, bits >> 40);

    Record::new(
        (bits % MAX_ID) as i64,
        format!("{first} {last}"),
        format!("{}.{}@{domain}", first.to_lowercase(), last.to_lowercase()),
        format!("555-{:03}-{:04}", (bits >> 48) % 1000, (bits >> 64) % 10000),
    )
}

async fn data(Query(params): Query<PageParams>) -> Json<Vec<Record>> {
    let size = page_size(params.size.as_deref());
    tracing::debug!(page = params.page.as_deref().unwrap_or("-"), size, "Serving page");
    Json((0..size).map(|_| fake_record()).collect())
}

fn router() -> Router {
    Router::new()
        .route("/data", get(data))
        .layer(tracing_layer())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_config = LogConfig::builder()
        .log_file_prefix("recsync-mock-source")
        .filter_directives("recsync_mock_source=info,tower_http=info")
        .build()
        .merge_env()?;
    init_logging(&log_config)?;

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    info!("Mock source listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router()).await?;

    Ok(())
}
