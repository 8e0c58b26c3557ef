use super::sort::SortExecutor;
use crate::aggregate::SecondaryAggregate;
use crate::core::{Entity, RenderKey};
use crate::store::{CollectionSnapshot, CollectionStore};
use crate::view::ViewState;
use serde::Serialize;

/// One visible row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectedRow {
    pub render_key: RenderKey,
    pub entity: Entity,
    /// Joined secondary aggregate value, zero when absent.
    pub aggregate: i64,
    /// True while a mutation on this row is in flight.
    pub pending: bool,
}

/// Output of one projection run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectedPage {
    pub rows: Vec<ProjectedRow>,
    /// Page index after clamping.
    pub page_index: usize,
    pub page_size: usize,
    pub total_pages: usize,
    pub filtered_count: usize,
    pub total_count: usize,
}

/// `ceil(count / page_size)`; zero page size yields zero pages.
pub fn total_pages(count: usize, page_size: usize) -> usize {
    if page_size == 0 {
        return 0;
    }
    count.div_ceil(page_size)
}

/// Clamp into `[0, max(0, total_pages - 1)]`.
pub fn clamp_page_index(page_index: usize, count: usize, page_size: usize) -> usize {
    let pages = total_pages(count, page_size);
    if pages == 0 {
        0
    } else {
        page_index.min(pages - 1)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct CacheKey {
    store_revision: u64,
    aggregate_revision: u64,
    view: ViewState,
}

/// Pure `(snapshot, aggregate, view) -> page` function, with a memo of the
/// last result keyed on the input revisions.
#[derive(Debug, Clone)]
pub struct ProjectionEngine {
    name_field: String,
    cache: Option<(CacheKey, ProjectedPage)>,
}

impl ProjectionEngine {
    pub fn new(name_field: &str) -> Self {
        Self {
            name_field: name_field.to_string(),
            cache: None,
        }
    }

    /// Entities whose name contains the trimmed search text,
    /// case-insensitively. Blank search text keeps everything.
    pub fn filter<'a>(&self, snapshot: &'a CollectionSnapshot, search_text: &str) -> Vec<&'a Entity> {
        let needle = search_text.trim().to_lowercase();
        if needle.is_empty() {
            return snapshot.values().collect();
        }
        snapshot
            .values()
            .filter(|entity| {
                entity
                    .text(&self.name_field)
                    .is_some_and(|name| name.to_lowercase().contains(&needle))
            })
            .collect()
    }

    pub fn filtered_count(&self, snapshot: &CollectionSnapshot, search_text: &str) -> usize {
        self.filter(snapshot, search_text).len()
    }

    /// Filter, sort, paginate. Rows carry default render keys and no
    /// pending flag; use [`ProjectionEngine::project_store`] for those.
    pub fn project(
        &self,
        snapshot: &CollectionSnapshot,
        aggregate: &SecondaryAggregate,
        view: &ViewState,
    ) -> ProjectedPage {
        let mut rows = self.filter(snapshot, &view.search_text);
        SortExecutor::sort(&mut rows, &view.sort_key, view.sort_direction, aggregate);

        let filtered_count = rows.len();
        let page_index = clamp_page_index(view.page_index, filtered_count, view.page_size);
        let start = page_index.saturating_mul(view.page_size).min(filtered_count);
        let end = start.saturating_add(view.page_size).min(filtered_count);

        let rows = rows[start..end]
            .iter()
            .map(|entity| ProjectedRow {
                render_key: RenderKey::from(&entity.id),
                entity: (*entity).clone(),
                aggregate: aggregate.value_or_zero(&entity.id),
                pending: false,
            })
            .collect();

        ProjectedPage {
            rows,
            page_index,
            page_size: view.page_size,
            total_pages: total_pages(filtered_count, view.page_size),
            filtered_count,
            total_count: snapshot.len(),
        }
    }

    /// Project the store's current snapshot, decorating rows with the
    /// store's render keys and pending flags.
    pub fn project_store(
        &self,
        store: &CollectionStore,
        aggregate: &SecondaryAggregate,
        view: &ViewState,
    ) -> ProjectedPage {
        let mut page = self.project(&store.snapshot(), aggregate, view);
        for row in &mut page.rows {
            row.render_key = store.render_key(&row.entity.id);
            row.pending = store.pending_for(&row.entity.id).is_some();
        }
        page
    }

    /// Like [`ProjectionEngine::project_store`], reusing the previous result
    /// when neither the store, the aggregate, nor the view changed.
    pub fn project_cached(
        &mut self,
        store: &CollectionStore,
        aggregate: &SecondaryAggregate,
        aggregate_revision: u64,
        view: &ViewState,
    ) -> ProjectedPage {
        let key = CacheKey {
            store_revision: store.revision(),
            aggregate_revision,
            view: view.clone(),
        };
        if let Some((cached_key, page)) = &self.cache {
            if *cached_key == key {
                return page.clone();
            }
        }
        let page = self.project_store(store, aggregate, view);
        self.cache = Some((key, page.clone()));
        page
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EntityDraft;
    use crate::projection::{SortDirection, SortKey};
    use chrono::Utc;

    fn snapshot(names: &[(&str, &str)]) -> CollectionSnapshot {
        let now = Utc::now();
        names
            .iter()
            .map(|(id, name)| {
                let entity = Entity::new(*id, EntityDraft::named(name).build(), now);
                (entity.id.clone(), entity)
            })
            .collect()
    }

    fn view(page_size: usize) -> ViewState {
        ViewState::new(SortKey::field("name"), page_size)
    }

    fn names(page: &ProjectedPage) -> Vec<String> {
        page.rows
            .iter()
            .map(|row| row.entity.text("name").unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn test_sorted_by_name_ascending() {
        let engine = ProjectionEngine::new("name");
        let snapshot = snapshot(&[("A", "Tools"), ("B", "Parts")]);
        let page = engine.project(&snapshot, &SecondaryAggregate::default(), &view(10));

        assert_eq!(names(&page), vec!["Parts", "Tools"]);
        assert_eq!(page.total_pages, 1);
    }

    #[test]
    fn test_search_is_trimmed_and_case_insensitive() {
        let engine = ProjectionEngine::new("name");
        let snapshot = snapshot(&[("a", "Power Tools"), ("b", "Parts"), ("c", "toolbox")]);
        let mut state = view(10);
        state.search_text = "  TOOL ".to_string();

        let page = engine.project(&snapshot, &SecondaryAggregate::default(), &state);
        assert_eq!(names(&page), vec!["Power Tools", "toolbox"]);
        assert_eq!(page.filtered_count, 2);
        assert_eq!(page.total_count, 3);
    }

    #[test]
    fn test_blank_search_is_identity() {
        let engine = ProjectionEngine::new("name");
        let snapshot = snapshot(&[("a", "x"), ("b", "y")]);
        assert_eq!(engine.filtered_count(&snapshot, "   "), 2);
    }

    #[test]
    fn test_out_of_range_page_is_clamped() {
        let engine = ProjectionEngine::new("name");
        let rows: Vec<(String, String)> = (0..23)
            .map(|i| (format!("id-{i:02}"), format!("Item {i:02}")))
            .collect();
        let refs: Vec<(&str, &str)> = rows.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
        let snapshot = snapshot(&refs);

        let mut state = view(10);
        state.page_index = 99;
        let page = engine.project(&snapshot, &SecondaryAggregate::default(), &state);

        assert_eq!(page.page_index, 2);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.rows.len(), 3);
    }

    #[test]
    fn test_empty_result_clamps_to_zero() {
        let engine = ProjectionEngine::new("name");
        let mut state = view(10);
        state.page_index = 4;
        let page = engine.project(&CollectionSnapshot::new(), &SecondaryAggregate::default(), &state);

        assert_eq!(page.page_index, 0);
        assert_eq!(page.total_pages, 0);
        assert!(page.rows.is_empty());
    }

    #[test]
    fn test_pagination_bounds() {
        for page_size in 1..8 {
            for count in 0..30 {
                for page_index in 0..40 {
                    let clamped = clamp_page_index(page_index, count, page_size);
                    let max = total_pages(count, page_size).saturating_sub(1);
                    assert!(clamped <= max);
                }
            }
        }
    }

    #[test]
    fn test_recompute_is_deterministic() {
        let engine = ProjectionEngine::new("name");
        let snapshot = snapshot(&[("c", "Same"), ("a", "Same"), ("b", "Other"), ("d", "Same")]);
        let mut state = view(2);
        state.sort_direction = SortDirection::Descending;

        let first = engine.project(&snapshot, &SecondaryAggregate::default(), &state);
        let second = engine.project(&snapshot, &SecondaryAggregate::default(), &state);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        let ids: Vec<String> = first.rows.iter().map(|r| r.entity.id.to_string()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn test_cached_projection_follows_store_revision() {
        let mut engine = ProjectionEngine::new("name");
        let mut store = CollectionStore::new();
        store.upsert(Entity::new("a", EntityDraft::named("Tools").build(), Utc::now()));
        let aggregate = SecondaryAggregate::default();
        let state = view(10);

        let first = engine.project_cached(&store, &aggregate, 0, &state);
        assert_eq!(first.rows.len(), 1);

        store.upsert(Entity::new("b", EntityDraft::named("Parts").build(), Utc::now()));
        let second = engine.project_cached(&store, &aggregate, 0, &state);
        assert_eq!(names(&second), vec!["Parts", "Tools"]);
    }
}
