//! Selector fallback: ordered extraction strategies per field with adaptive
//! scoring.
//!
//! Every field carries a list of strategies (CSS locator + optional
//! attribute + optional post-processor). Extraction walks them in score
//! order, validates each raw value against the field's lightweight acceptor,
//! and records per-strategy success/failure counters. Strategies are
//! re-sorted by `(successes + 1) / (successes + failures + 2)` after every
//! `reorder_every` attempts, and counters persist across runs next to the
//! cache index.
//!
//! The component never assumes a DOM engine: each strategy carries its own
//! evaluator closure over a [`scraper::ElementRef`].

use crate::metrics::SharedMetrics;
use parking_lot::Mutex;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

const DEFAULT_REORDER_EVERY: u32 = 50;

type Evaluator = Box<dyn for<'a> Fn(ElementRef<'a>) -> Vec<String> + Send + Sync>;

/// Lightweight shape check applied before a raw value is accepted
pub struct Acceptor {
    pub min_len: usize,
    pub max_len: usize,
    pub pattern: Option<Regex>,
}

impl Acceptor {
    fn length(min_len: usize, max_len: usize) -> Self {
        Self {
            min_len,
            max_len,
            pattern: None,
        }
    }

    fn shaped(min_len: usize, max_len: usize, pattern: &str) -> Self {
        Self {
            min_len,
            max_len,
            pattern: Some(Regex::new(pattern).expect("invalid acceptor pattern")),
        }
    }

    fn accepts(&self, value: &str) -> bool {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.len() < self.min_len || trimmed.len() > self.max_len {
            return false;
        }
        match &self.pattern {
            Some(pattern) => pattern.is_match(trimmed),
            None => true,
        }
    }
}

/// One extraction strategy: a named evaluator plus its track record
pub struct Strategy {
    pub name: String,
    evaluator: Evaluator,
    successes: u64,
    failures: u64,
}

impl Strategy {
    /// Inner text of the first/each match of a CSS locator
    pub fn css(name: &str, selector: &str) -> Self {
        let sel = Selector::parse(selector).expect("invalid CSS selector");
        Self::new(name, move |context| {
            context
                .select(&sel)
                .map(|el| el.text().collect::<String>())
                .collect()
        })
    }

    /// An attribute of the first/each match of a CSS locator
    pub fn css_attr(name: &str, selector: &str, attr: &'static str) -> Self {
        let sel = Selector::parse(selector).expect("invalid CSS selector");
        Self::new(name, move |context| {
            context
                .select(&sel)
                .filter_map(|el| el.value().attr(attr).map(|v| v.to_string()))
                .collect()
        })
    }

    /// Arbitrary evaluator, for callers that bring their own query engine
    pub fn new<F>(name: &str, evaluator: F) -> Self
    where
        F: for<'a> Fn(ElementRef<'a>) -> Vec<String> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            evaluator: Box::new(evaluator),
            successes: 0,
            failures: 0,
        }
    }

    /// Laplace-smoothed success rate
    pub fn score(&self) -> f64 {
        (self.successes + 1) as f64 / (self.successes + self.failures + 2) as f64
    }
}

struct FieldCatalog {
    strategies: Vec<Strategy>,
    acceptor: Acceptor,
    attempts_since_reorder: u32,
}

impl FieldCatalog {
    fn new(strategies: Vec<Strategy>, acceptor: Acceptor) -> Self {
        Self {
            strategies,
            acceptor,
            attempts_since_reorder: 0,
        }
    }

    fn maybe_reorder(&mut self, reorder_every: u32) {
        self.attempts_since_reorder += 1;
        if self.attempts_since_reorder >= reorder_every {
            self.attempts_since_reorder = 0;
            self.strategies
                .sort_by(|a, b| b.score().partial_cmp(&a.score()).unwrap_or(std::cmp::Ordering::Equal));
        }
    }
}

/// Card locator: finds the repeated job elements on a listing page
struct CardStrategy {
    name: String,
    selector: Selector,
    successes: u64,
    failures: u64,
}

impl CardStrategy {
    fn new(name: &str, selector: &str) -> Self {
        Self {
            name: name.to_string(),
            selector: Selector::parse(selector).expect("invalid CSS selector"),
            successes: 0,
            failures: 0,
        }
    }

    fn score(&self) -> f64 {
        (self.successes + 1) as f64 / (self.successes + self.failures + 2) as f64
    }
}

/// Persisted counter state, keyed by field then strategy name
#[derive(Debug, Default, Serialize, Deserialize)]
struct ScoreStore {
    #[serde(default)]
    fields: BTreeMap<String, BTreeMap<String, (u64, u64)>>,
    #[serde(default)]
    cards: BTreeMap<String, (u64, u64)>,
}

pub struct SelectorEngine {
    fields: Mutex<HashMap<String, FieldCatalog>>,
    cards: Mutex<Vec<CardStrategy>>,
    scores_path: Mutex<Option<PathBuf>>,
    metrics: SharedMetrics,
    reorder_every: u32,
}

impl SelectorEngine {
    pub fn new(metrics: SharedMetrics) -> Self {
        Self {
            fields: Mutex::new(HashMap::new()),
            cards: Mutex::new(Vec::new()),
            scores_path: Mutex::new(None),
            metrics,
            reorder_every: DEFAULT_REORDER_EVERY,
        }
    }

    /// Engine seeded with the job-listing catalogs
    pub fn with_defaults(metrics: SharedMetrics) -> Self {
        let engine = Self::new(metrics);
        seed_catalogs(&engine);
        engine
    }

    pub fn register_field(&self, field: &str, strategies: Vec<Strategy>, acceptor: Acceptor) {
        self.fields
            .lock()
            .insert(field.to_string(), FieldCatalog::new(strategies, acceptor));
    }

    pub fn register_card(&self, name: &str, selector: &str) {
        self.cards.lock().push(CardStrategy::new(name, selector));
    }

    /// Extract a single value for `field` from `context`, walking strategies
    /// in score order. `None` means every strategy struck out.
    pub fn extract(&self, context: ElementRef<'_>, field: &str) -> Option<String> {
        self.extract_inner(context, field, false)
            .into_iter()
            .next()
    }

    /// Extract all accepted values for a multi-valued field
    pub fn extract_all(&self, context: ElementRef<'_>, field: &str) -> Vec<String> {
        self.extract_inner(context, field, true)
    }

    fn extract_inner(&self, context: ElementRef<'_>, field: &str, multi: bool) -> Vec<String> {
        let mut fields = self.fields.lock();
        let Some(catalog) = fields.get_mut(field) else {
            tracing::debug!(field, "no strategy catalog registered");
            return Vec::new();
        };

        catalog.maybe_reorder(self.reorder_every);

        for (rank, strategy) in catalog.strategies.iter_mut().enumerate() {
            let raw = (strategy.evaluator)(context);
            let accepted: Vec<String> = raw
                .into_iter()
                .map(|v| v.trim().to_string())
                .filter(|v| catalog.acceptor.accepts(v))
                .collect();

            if accepted.is_empty() {
                strategy.failures += 1;
                continue;
            }

            strategy.successes += 1;
            if rank > 0 {
                self.metrics.inc(&format!("selector.fallback_used.{field}"));
                tracing::debug!(field, strategy = %strategy.name, rank, "fallback strategy used");
            }
            return if multi { accepted } else { accepted.into_iter().take(1).collect() };
        }

        self.metrics.inc(&format!("selector.fallback_exhausted.{field}"));
        tracing::debug!(field, "all extraction strategies failed");
        Vec::new()
    }

    /// Locate the repeated job-card elements on a listing page
    pub fn select_cards<'a>(&self, html: &'a Html) -> Vec<ElementRef<'a>> {
        let mut cards = self.cards.lock();
        cards.sort_by(|a, b| {
            b.score()
                .partial_cmp(&a.score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let root = html.root_element();
        for strategy in cards.iter_mut() {
            let found: Vec<ElementRef<'a>> = root.select(&strategy.selector).collect();
            if found.is_empty() {
                strategy.failures += 1;
            } else {
                strategy.successes += 1;
                return found;
            }
        }
        self.metrics.inc("selector.fallback_exhausted.job_card");
        Vec::new()
    }

    /// Attach a score store file and load any persisted counters
    pub fn with_score_store(self, path: PathBuf) -> Self {
        self.load_scores(&path);
        *self.scores_path.lock() = Some(path);
        self
    }

    fn load_scores(&self, path: &PathBuf) {
        let Ok(content) = std::fs::read_to_string(path) else {
            return;
        };
        let Ok(store) = serde_json::from_str::<ScoreStore>(&content) else {
            tracing::warn!(path = %path.display(), "ignoring unreadable selector score store");
            return;
        };

        let mut fields = self.fields.lock();
        for (field, counters) in &store.fields {
            if let Some(catalog) = fields.get_mut(field) {
                for strategy in &mut catalog.strategies {
                    if let Some((s, f)) = counters.get(&strategy.name) {
                        strategy.successes = *s;
                        strategy.failures = *f;
                    }
                }
                catalog
                    .strategies
                    .sort_by(|a, b| b.score().partial_cmp(&a.score()).unwrap_or(std::cmp::Ordering::Equal));
            }
        }
        let mut cards = self.cards.lock();
        for card in cards.iter_mut() {
            if let Some((s, f)) = store.cards.get(&card.name) {
                card.successes = *s;
                card.failures = *f;
            }
        }
    }

    /// Persist counters atomically (temp file + rename)
    pub fn save_scores(&self) -> std::io::Result<()> {
        let Some(path) = self.scores_path.lock().clone() else {
            return Ok(());
        };

        let mut store = ScoreStore::default();
        {
            let fields = self.fields.lock();
            for (field, catalog) in fields.iter() {
                let counters = catalog
                    .strategies
                    .iter()
                    .map(|s| (s.name.clone(), (s.successes, s.failures)))
                    .collect();
                store.fields.insert(field.clone(), counters);
            }
            let cards = self.cards.lock();
            for card in cards.iter() {
                store
                    .cards
                    .insert(card.name.clone(), (card.successes, card.failures));
            }
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec_pretty(&store)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &path)
    }

    /// Current score of a strategy, for tests and diagnostics
    pub fn strategy_score(&self, field: &str, strategy_name: &str) -> Option<f64> {
        let fields = self.fields.lock();
        fields.get(field).and_then(|catalog| {
            catalog
                .strategies
                .iter()
                .find(|s| s.name == strategy_name)
                .map(|s| s.score())
        })
    }
}

/// Seed the engine with the listing-site catalogs: per-field fallback chains
/// ordered from the most specific locator to the loosest.
fn seed_catalogs(engine: &SelectorEngine) {
    engine.register_card("testid_card", "[data-testid=\"job-card\"]");
    engine.register_card("article_card", "article.job-card");
    engine.register_card("vaga_item", "li[class*=\"vaga\"]");
    engine.register_card("generic_card", "div[class*=\"job-card\"]");
    engine.register_card("list_item", "ul.job-list > li");

    engine.register_field(
        "title",
        vec![
            Strategy::css("vagas_anchor", "h2 a[href*=\"/vagas/\"]"),
            Strategy::css("testid_title", "[data-testid=\"job-title\"]"),
            Strategy::css("h1_job_title", "h1.job-title"),
            Strategy::css("card_heading", "h2 a"),
            Strategy::css("loose_title", "[class*=\"title\"] a"),
        ],
        Acceptor::length(5, 200),
    );

    engine.register_field(
        "url",
        vec![
            Strategy::css_attr("vagas_anchor_href", "h2 a[href*=\"/vagas/\"]", "href"),
            Strategy::css_attr("testid_link", "[data-testid=\"job-link\"]", "href"),
            Strategy::css_attr("any_vagas_href", "a[href*=\"/vagas/\"]", "href"),
            Strategy::css_attr("job_link_class", "a.job-link", "href"),
        ],
        Acceptor::shaped(2, 500, "/"),
    );

    engine.register_field(
        "company",
        vec![
            Strategy::css("testid_company", "[data-testid=\"company-name\"]"),
            Strategy::css("company_class", "[class*=\"company\"]"),
            Strategy::css("empresa_class", "[class*=\"empresa\"]"),
            Strategy::css("job_company", ".job-company"),
        ],
        Acceptor::length(2, 100),
    );

    engine.register_field(
        "location",
        vec![
            Strategy::css("testid_location", "[data-testid=\"job-location\"]"),
            Strategy::css("location_class", "[class*=\"location\"]"),
            Strategy::css("local_class", "[class*=\"local\"]"),
            Strategy::css_attr("local_button", "button[title*=\"Local\"]", "title"),
        ],
        Acceptor::length(2, 100),
    );

    engine.register_field(
        "description",
        vec![
            Strategy::css("testid_description", "[data-testid=\"job-description\"]"),
            Strategy::css("description_class", ".job-description"),
            Strategy::css("loose_description", "[class*=\"description\"]"),
            Strategy::css("descricao_class", "[class*=\"descricao\"]"),
        ],
        Acceptor::length(20, 10_000),
    );

    engine.register_field(
        "salary",
        vec![
            Strategy::css("testid_salary", "[data-testid=\"salary\"]"),
            Strategy::css("testid_job_salary", "[data-testid=\"job-salary\"]"),
            Strategy::css("salary_class", ".salary"),
            Strategy::css("salario_class", "[class*=\"salario\"]"),
            Strategy::css("loose_salary", "[class*=\"salary\"]"),
        ],
        Acceptor::shaped(2, 120, r"(?i)\d|combinar|competitive"),
    );

    engine.register_field(
        "technologies",
        vec![
            Strategy::css("testid_tech", "[data-testid=\"job-technologies\"] li"),
            Strategy::css("tech_tags", "[class*=\"tech\"] li"),
            Strategy::css("tag_spans", ".tags span"),
            Strategy::css("requirements", "[class*=\"requisito\"] li"),
        ],
        Acceptor::length(2, 60),
    );

    engine.register_field(
        "benefits",
        vec![
            Strategy::css("testid_benefits", "[data-testid=\"job-benefits\"] li"),
            Strategy::css("benefit_items", "[class*=\"benefit\"] li"),
            Strategy::css("beneficio_items", "[class*=\"beneficio\"] li"),
        ],
        Acceptor::length(3, 120),
    );

    engine.register_field(
        "work_mode",
        vec![
            Strategy::css("testid_work_mode", "[data-testid=\"work-mode\"]"),
            Strategy::css("modalidade_class", "[class*=\"modalidade\"]"),
            Strategy::css("work_mode_class", "[class*=\"work-mode\"]"),
        ],
        Acceptor::shaped(4, 60, r"(?i)remot|h[íi]brid|hybrid|presencial|on-?site|home office"),
    );

    engine.register_field(
        "level",
        vec![
            Strategy::css("testid_level", "[data-testid=\"experience-level\"]"),
            Strategy::css("nivel_class", "[class*=\"nivel\"]"),
            Strategy::css("level_class", "[class*=\"level\"]"),
        ],
        Acceptor::length(2, 60),
    );

    engine.register_field(
        "posted_at",
        vec![
            Strategy::css_attr("time_datetime", "time", "datetime"),
            Strategy::css("testid_publish_date", "[data-testid=\"publish-date\"]"),
            Strategy::css("date_class", "[class*=\"date\"]"),
        ],
        Acceptor::shaped(2, 60, r"(?i)\d|h[áa]|hoje|ontem"),
    );

    // Pagination detection runs through the same fallback machinery
    engine.register_field(
        "pagination_next",
        vec![
            Strategy::css_attr("rel_next", "a[rel=\"next\"]", "href"),
            Strategy::css_attr("next_class", "a[class*=\"next\"]", "href"),
            Strategy::css_attr("proxima", "a[aria-label*=\"xima\"]", "href"),
        ],
        Acceptor::length(1, 500),
    );
    engine.register_field(
        "pagination_numeric",
        vec![
            Strategy::css("pagination_links", ".pagination a"),
            Strategy::css_attr("page_param_links", "a[href*=\"page=\"]", "href"),
            Strategy::css("pager_links", "nav[class*=\"pag\"] a"),
        ],
        Acceptor::length(1, 500),
    );
    engine.register_field(
        "pagination_infinite",
        vec![
            Strategy::css_attr("infinite_marker", "[data-infinite-scroll]", "data-infinite-scroll"),
            Strategy::css("load_more", "button[class*=\"load-more\"]"),
        ],
        Acceptor::length(1, 200),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn engine() -> (SelectorEngine, SharedMetrics) {
        let metrics: SharedMetrics = Arc::new(Metrics::new());
        (SelectorEngine::with_defaults(Arc::clone(&metrics)), metrics)
    }

    const CARD_HTML: &str = r#"
        <article class="job-card">
            <h2><a href="/vagas/backend-dev/401">Backend Developer (Rust)</a></h2>
            <span class="company-name">Orbita Sistemas</span>
            <span class="job-location">Curitiba</span>
            <div class="job-description">Develop and operate ingestion services written in Rust.</div>
            <span class="salario-faixa">R$ 8.000 - R$ 11.000</span>
        </article>
    "#;

    #[test]
    fn test_primary_strategy_extracts() {
        let (engine, _) = engine();
        let html = Html::parse_fragment(CARD_HTML);
        let root = html.root_element();

        assert_eq!(
            engine.extract(root, "title").unwrap(),
            "Backend Developer (Rust)"
        );
        assert_eq!(engine.extract(root, "url").unwrap(), "/vagas/backend-dev/401");
        assert_eq!(engine.extract(root, "company").unwrap(), "Orbita Sistemas");
    }

    #[test]
    fn test_fallback_used_when_primary_drifts() {
        let (engine, metrics) = engine();
        // Salary present only under the fourth locator's class shape
        let html = Html::parse_fragment(
            r#"<div><span class="salario-box">R$ 5.000 - R$ 7.000</span></div>"#,
        );
        let root = html.root_element();

        let value = engine.extract(root, "salary").unwrap();
        assert_eq!(value, "R$ 5.000 - R$ 7.000");
        assert_eq!(metrics.counter("selector.fallback_used.salary"), 1);
        // The winning strategy's score rose above the untouched ones
        let winner = engine.strategy_score("salary", "salario_class").unwrap();
        let loser = engine.strategy_score("salary", "testid_salary").unwrap();
        assert!(winner > loser);
    }

    #[test]
    fn test_exhaustion_records_metric() {
        let (engine, metrics) = engine();
        let html = Html::parse_fragment("<div><p>nothing here</p></div>");
        let root = html.root_element();

        assert!(engine.extract(root, "salary").is_none());
        assert_eq!(metrics.counter("selector.fallback_exhausted.salary"), 1);
    }

    #[test]
    fn test_acceptor_rejects_short_values() {
        let (engine, _) = engine();
        let html = Html::parse_fragment(r#"<div><h2><a href="/vagas/x/1">ab</a></h2></div>"#);
        let root = html.root_element();
        // Title of 2 chars fails the length acceptor on every strategy
        assert!(engine.extract(root, "title").is_none());
    }

    #[test]
    fn test_select_cards_falls_back() {
        let (engine, _) = engine();
        let html = Html::parse_document(
            r#"<html><body>
                <div class="job-card">a</div>
                <div class="job-card">b</div>
            </body></html>"#,
        );
        // No [data-testid="job-card"] or article.job-card present; the
        // looser div locator picks the cards up.
        let cards = engine.select_cards(&html);
        assert_eq!(cards.len(), 2);
    }

    #[test]
    fn test_extract_all_multi_valued() {
        let (engine, _) = engine();
        let html = Html::parse_fragment(
            r#"<div class="tech-stack"><ul>
                <li>Rust</li><li>Kafka</li><li>Postgres</li>
            </ul></div>"#,
        );
        // tech_tags matches `[class*="tech"] li`
        let values = engine.extract_all(html.root_element(), "technologies");
        assert_eq!(values, vec!["Rust", "Kafka", "Postgres"]);
    }

    #[test]
    fn test_scores_persist_across_engines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("selector_scores.json");

        let metrics: SharedMetrics = Arc::new(Metrics::new());
        let engine =
            SelectorEngine::with_defaults(Arc::clone(&metrics)).with_score_store(path.clone());

        let html =
            Html::parse_fragment(r#"<div><span class="salario-x">R$ 4.000</span></div>"#);
        engine.extract(html.root_element(), "salary").unwrap();
        engine.save_scores().unwrap();

        let reloaded =
            SelectorEngine::with_defaults(Arc::clone(&metrics)).with_score_store(path);
        let restored = reloaded.strategy_score("salary", "salario_class").unwrap();
        assert!(restored > 0.5, "persisted success did not survive reload");
    }

    #[test]
    fn test_reorder_promotes_winning_strategy() {
        let metrics: SharedMetrics = Arc::new(Metrics::new());
        let engine = SelectorEngine::new(Arc::clone(&metrics));
        engine.register_field(
            "probe",
            vec![
                Strategy::css("never_matches", ".missing"),
                Strategy::css("always_matches", ".present"),
            ],
            Acceptor::length(1, 100),
        );

        let html = Html::parse_fragment(r#"<div><span class="present">value</span></div>"#);
        let root = html.root_element();
        for _ in 0..(DEFAULT_REORDER_EVERY + 2) {
            engine.extract(root, "probe");
        }

        // After reordering, the winner runs first: its failure count stops
        // growing while successes keep accruing.
        let winner = engine.strategy_score("probe", "always_matches").unwrap();
        let loser = engine.strategy_score("probe", "never_matches").unwrap();
        assert!(winner > 0.9);
        assert!(loser < 0.1);
    }
}
