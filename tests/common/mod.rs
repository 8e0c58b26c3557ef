#![allow(dead_code)]

use chrono::Utc;
use livecollection::{Entity, EntityDraft, EntityId, InMemoryRemote, ProjectedPage};
use std::time::Duration;

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

pub fn category(id: &str, name: &str, parent: Option<&str>, order: i64) -> Entity {
    let parent = parent.map(EntityId::from);
    Entity::new(
        id,
        EntityDraft::named(name)
            .parent(parent.as_ref())
            .display_order(order)
            .active(true)
            .build(),
        Utc::now(),
    )
}

/// Backend holding `{A: Tools, B: Parts}`.
pub fn tools_and_parts() -> InMemoryRemote {
    let remote = InMemoryRemote::new("categories");
    remote.seed(vec![
        category("A", "Tools", None, 0),
        category("B", "Parts", None, 1),
    ]);
    remote
}

/// Backend holding `count` rows named "Item 000", "Item 001", ...
pub fn numbered(count: usize) -> InMemoryRemote {
    let remote = InMemoryRemote::new("categories");
    remote.seed(
        (0..count)
            .map(|i| category(&format!("id-{i:03}"), &format!("Item {i:03}"), None, i as i64))
            .collect(),
    );
    remote
}

pub fn names(page: &ProjectedPage) -> Vec<String> {
    page.rows
        .iter()
        .map(|row| row.entity.text("name").unwrap_or_default().to_string())
        .collect()
}
