use anyhow::{Context, Result, anyhow, ensure};
use clap::{Parser, Subcommand};
use livecollection::{
    ChangeEvent, CollectionError, EngineConfig, Entity, EntityDraft, EntityId, InMemoryRemote,
    LiveCollection, ProjectedPage, RemoteOp, SortDirection, SortKey, ViewEvent,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "livecollection")]
#[command(about = "Live collection view engine demo over an in-memory backend")]
struct Cli {
    /// Engine configuration as a connection string
    #[arg(long, default_value = "livecollection://categories")]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay the end-to-end scenarios and report each outcome
    Scenarios,
    /// Seed generated categories and print one page of the projection
    Browse {
        #[arg(long, default_value_t = 30)]
        seed: usize,
        #[arg(long, default_value = "")]
        search: String,
        /// Field to sort on, or "products" for the aggregate
        #[arg(long, default_value = "name")]
        sort: String,
        #[arg(long)]
        desc: bool,
        #[arg(long, default_value_t = 0)]
        page: usize,
        #[arg(long)]
        page_size: Option<usize>,
    },
    /// Print the parsed configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::from_url(&cli.url).map_err(|e| anyhow!(e))?;
    config.validate().map_err(|e| anyhow!(e))?;

    match cli.command {
        Command::Scenarios => run_scenarios(config).await,
        Command::Browse {
            seed,
            search,
            sort,
            desc,
            page,
            page_size,
        } => browse(config, seed, &search, &sort, desc, page, page_size).await,
        Command::Config => {
            let json = serde_json::to_string_pretty(&config).context("Failed to encode config")?;
            println!("{}", json);
            Ok(())
        }
    }
}

fn seeded_remote(topic: &str, count: usize) -> InMemoryRemote {
    let remote = InMemoryRemote::new(topic);
    let now = chrono::Utc::now();
    let mut counts = HashMap::new();
    let rows = (0..count)
        .map(|i| {
            let id = EntityId::new(format!("seed-{i:03}"));
            counts.insert(id.clone(), ((i * 7) % 13) as i64);
            Entity::new(
                id,
                EntityDraft::named(&format!("Category {i:03}"))
                    .parent(None)
                    .display_order(i as i64)
                    .active(true)
                    .build(),
                now,
            )
        })
        .collect();
    remote.seed(rows);
    remote.set_aggregate(counts);
    remote
}

async fn browse(
    config: EngineConfig,
    seed: usize,
    search: &str,
    sort: &str,
    desc: bool,
    page: usize,
    page_size: Option<usize>,
) -> Result<()> {
    let remote = seeded_remote(&config.topic, seed);
    let collection = LiveCollection::builder(config, Arc::new(remote.clone()))
        .aggregate_source(Arc::new(remote))
        .build()?;
    collection.load().await?;
    collection.refresh_aggregate_if_stale().await?;

    let key = match sort {
        "products" => SortKey::Aggregate,
        field => SortKey::field(field),
    };
    collection.set_search_text(search)?;
    collection.set_sort(key)?;
    let direction = if desc {
        SortDirection::Descending
    } else {
        SortDirection::Ascending
    };
    collection.set_sort_direction(direction)?;
    if let Some(size) = page_size {
        collection.set_page_size(size)?;
    }
    let projected = collection.set_page_index(page)?;
    print_page(&projected);
    Ok(())
}

fn print_page(page: &ProjectedPage) {
    println!(
        "page {}/{} ({} of {} rows match)",
        page.page_index + 1,
        page.total_pages.max(1),
        page.filtered_count,
        page.total_count
    );
    for row in &page.rows {
        println!(
            "  {:<14} {:<24} products={:<4}{}",
            row.render_key.as_str(),
            row.entity.text("name").unwrap_or("-"),
            row.aggregate,
            if row.pending { " (pending)" } else { "" }
        );
    }
}

fn report(name: &str, outcome: Result<()>) -> bool {
    match outcome {
        Ok(()) => {
            println!("[ok]   {}", name);
            true
        }
        Err(err) => {
            println!("[FAIL] {}: {:#}", name, err);
            false
        }
    }
}

async fn run_scenarios(config: EngineConfig) -> Result<()> {
    let results = [
        report("sort by name", scenario_sort(config.clone()).await),
        report("offline create rolls back", scenario_offline_create(config.clone()).await),
        report("remote delete aborts pending update", scenario_stale_write(config.clone()).await),
        report("page size keeps position", scenario_page_size(config.clone()).await),
        report("duplicate temporary id", scenario_duplicate_temp_id(config).await),
    ];
    let failed = results.iter().filter(|ok| !**ok).count();
    ensure!(failed == 0, "{} scenario(s) failed", failed);
    Ok(())
}

async fn open_with(config: EngineConfig, remote: &InMemoryRemote) -> Result<LiveCollection> {
    let collection = LiveCollection::new(config, Arc::new(remote.clone()))?;
    collection.load().await?;
    Ok(collection)
}

fn names(page: &ProjectedPage) -> Vec<&str> {
    page.rows
        .iter()
        .map(|row| row.entity.text("name").unwrap_or_default())
        .collect()
}

fn tools_and_parts(topic: &str) -> InMemoryRemote {
    let remote = InMemoryRemote::new(topic);
    let now = chrono::Utc::now();
    remote.seed(vec![
        Entity::new("A", EntityDraft::named("Tools").build(), now),
        Entity::new("B", EntityDraft::named("Parts").build(), now),
    ]);
    remote
}

async fn scenario_sort(config: EngineConfig) -> Result<()> {
    let remote = tools_and_parts(&config.topic);
    let collection = open_with(config, &remote).await?;
    let page = collection.get_visible_rows()?;
    ensure!(names(&page) == ["Parts", "Tools"], "got {:?}", names(&page));
    Ok(())
}

async fn scenario_offline_create(config: EngineConfig) -> Result<()> {
    let remote = tools_and_parts(&config.topic);
    let collection = open_with(config, &remote).await?;
    let before = collection.snapshot()?;
    let mut events = collection.subscribe_events();

    remote.set_offline(true);
    let err = collection
        .create_entity(EntityDraft::named("Bolts").build())
        .await
        .err()
        .context("create should fail while offline")?;
    ensure!(err.is_network_failure(), "unexpected error {}", err);
    ensure!(collection.snapshot()? == before, "store not restored");

    loop {
        match events.try_recv().context("no MutationFailed event")? {
            ViewEvent::MutationFailed { error, .. } => {
                ensure!(error.is_network_failure(), "unexpected reason {}", error);
                return Ok(());
            }
            _ => continue,
        }
    }
}

async fn scenario_stale_write(config: EngineConfig) -> Result<()> {
    let remote = tools_and_parts(&config.topic);
    remote.set_latency(Duration::from_millis(50));
    let collection = Arc::new(open_with(config.clone(), &remote).await?);

    let pending = {
        let collection = Arc::clone(&collection);
        tokio::spawn(async move {
            collection
                .update_entity(&"B".into(), EntityDraft::named("Fasteners").build())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let event = ChangeEvent::delete(&config.topic, "B".into(), chrono::Utc::now());
    collection.ingest(&event)?;
    remote.external_delete(&"B".into());

    let result = pending.await.context("update task panicked")?;
    ensure!(
        matches!(result, Err(CollectionError::StaleWrite { current: None, .. })),
        "expected a stale write, got {:?}",
        result
    );
    ensure!(collection.entity(&"B".into())?.is_none(), "B still present");
    ensure!(remote.calls(RemoteOp::Update) == 1, "update not issued");
    Ok(())
}

async fn scenario_page_size(config: EngineConfig) -> Result<()> {
    let remote = seeded_remote(&config.topic, 30);
    let collection = open_with(config, &remote).await?;
    collection.set_page_size(10)?;
    collection.set_page_index(1)?;
    let page = collection.set_page_size(25)?;
    ensure!(page.page_index == 0, "page index {}", page.page_index);
    ensure!(
        page.rows.iter().any(|row| row.entity.text("name") == Some("Category 010")),
        "row 11 no longer visible"
    );
    Ok(())
}

async fn scenario_duplicate_temp_id(config: EngineConfig) -> Result<()> {
    let remote = tools_and_parts(&config.topic);
    remote.set_latency(Duration::from_millis(20));
    let collection = open_with(config, &remote).await?;
    let temp_id = EntityId::new("tmp-dup");

    let (first, second) = tokio::join!(
        collection.create_entity_with_temp_id(temp_id.clone(), EntityDraft::named("Bolts").build()),
        collection.create_entity_with_temp_id(temp_id.clone(), EntityDraft::named("Bolts").build())
    );
    first.context("first create")?;
    ensure!(
        matches!(second, Err(CollectionError::ConflictingMutation(_))),
        "expected conflicting mutation, got {:?}",
        second
    );
    ensure!(remote.calls(RemoteOp::Create) == 1, "second create reached the backend");
    Ok(())
}
