//! `dimmer`: run the content script and a popup against a page fixture.
//!
//! The page is built from a JSON [`PageSpec`], a popup connects over an
//! in-process port, the given slider values and toggles are replayed, and the
//! resulting `<body>` subtree is printed as JSON.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use dimmer_runtime::{popup, ContentScript, Manifest, Popup};
use ext_dom::{Document, NodeSpec, PageSpec};
use ext_ipc::{MessageSender, Port};
use ext_storage::{MemoryStorage, SqliteStorage, StorageArea};
use ext_timers::Timers;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::LocalSet;

#[derive(Debug, Parser)]
#[command(name = "dimmer", version, about = "Headless brightness dimmer harness")]
struct Cli {
    /// Manifest path
    #[arg(long, default_value = "dimmer.toml")]
    config: PathBuf,

    /// Page fixture (JSON). Defaults to a page with one image.
    #[arg(long)]
    page: Option<PathBuf>,

    /// Keep origin state in memory instead of the SQLite store
    #[arg(long, action = ArgAction::SetTrue)]
    in_memory: bool,

    /// Slider values to replay, in order
    #[arg(long = "slider", value_name = "VALUE")]
    sliders: Vec<f64>,

    /// Flip the enable toggle after the slider values
    #[arg(long, action = ArgAction::SetTrue)]
    toggle: bool,

    /// Force debug relays regardless of the manifest
    #[arg(long, action = ArgAction::SetTrue)]
    debug: bool,
}

fn main() -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("creating tokio runtime")?;

    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("DIMMER_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let local = LocalSet::new();
    let body = rt.block_on(local.run_until(run(cli)))?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn load_page(path: Option<&Path>) -> Result<Document> {
    let page = match path {
        Some(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading page fixture at {}", path.display()))?;
            serde_json::from_str::<PageSpec>(&text).context("parsing page fixture")?
        }
        None => PageSpec {
            host: "example.com".to_string(),
            body: vec![NodeSpec::element("img").with_attribute("src", "photo.png")],
            ..Default::default()
        },
    };
    Document::from_page(&page).context("building page")
}

async fn run(cli: Cli) -> Result<NodeSpec> {
    let mut manifest = Manifest::load(&cli.config).await?;
    manifest.app.debug |= cli.debug;
    tracing::info!(app = %manifest.app.name, "dimmer.start");

    let storage: Rc<dyn StorageArea> = if cli.in_memory {
        Rc::new(MemoryStorage::new())
    } else {
        let path = manifest.storage_path();
        Rc::new(
            SqliteStorage::open(&path)
                .await
                .with_context(|| format!("opening storage at {}", path.display()))?,
        )
    };

    let document = load_page(cli.page.as_deref()).await?.into_shared();
    let timers = Timers::new();

    let mut script = ContentScript::new(document.clone(), &manifest, storage.clone(), timers.clone())?;
    script.init().await?;
    let (connections, incoming) = mpsc::unbounded_channel();
    let content = tokio::task::spawn_local(script.run(incoming));

    let (popup_end, tab_end) = Port::pair(
        manifest.app.name.clone(),
        MessageSender::extension(manifest.app.extension_id.clone()),
    );
    connections
        .send(tab_end)
        .map_err(|_| anyhow::anyhow!("content script stopped before the popup connected"))?;
    let mut popup = Popup::connect(popup::default_document()?, popup_end, storage, &manifest, timers)?;

    while !popup.is_mounted() {
        if !popup.pump().await? {
            anyhow::bail!("tab closed the connection before the popup mounted");
        }
    }

    let step = Duration::from_millis(manifest.popup.slider_debounce_ms);
    for value in &cli.sliders {
        popup.on_slider_input(*value)?;
        tokio::time::sleep(step).await;
    }
    // let the last SET_BRIGHTNESS go out before closing
    tokio::time::sleep(step * 2).await;
    if cli.toggle {
        popup.on_toggle().await?;
    }
    popup.close().await;
    drop(connections);

    let script = content.await.context("content script task")?;
    tracing::info!(
        origin = %script.origin(),
        state = ?script.brightness_state(),
        observing = script.is_observing(),
        "dimmer.done"
    );

    // past the background transition so the printed styles are settled
    tokio::time::sleep(manifest.transition_duration()).await;
    let doc = document.borrow();
    Ok(doc.snapshot(doc.body()))
}
