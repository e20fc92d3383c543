//! Batch request aggregation for LLM-style providers.
//!
//! Many small logical requests ("extract speakers from event X") are merged
//! into fewer combined provider calls, then the single structured response is
//! demultiplexed back to the original items by explicit id correlation, never
//! by array position, so a provider omitting or reordering items cannot
//! misattribute results. An item whose id is absent from the response gets its
//! default value; a chunk whose response cannot be parsed at all falls back to
//! a conservative per-item heuristic. Neither case is an error.
//!
//! Provider calls go through the [`RetryExecutor`] under the aggregator's
//! service name, so transient provider failures are retried per the service's
//! policy before any fallback kicks in.

use crate::json_repair::parse_lenient;
use crate::retry::RetryExecutor;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One logical request inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub id: String,
    pub text: String,
}

impl BatchItem {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self { id: id.into(), text: text.into() }
    }
}

/// Provider failure for one combined call.
#[derive(Debug, thiserror::Error)]
#[error("provider call failed: {0}")]
pub struct BatchProviderError(pub String);

/// The underlying LLM-shaped provider: one combined prompt in, one raw
/// structured response out.
#[async_trait]
pub trait BatchProvider: Send + Sync + std::fmt::Debug {
    async fn call(&self, prompt: &str) -> Result<String, BatchProviderError>;
}

/// A merge-able call kind: how to build the combined request and how to score
/// an item conservatively when the provider response is unusable.
///
/// The provider is expected to answer with a JSON array (bare or under a
/// `"results"` key) of `{"id": …, "result": …}` objects, where `result`
/// deserializes to `Output`.
pub trait BatchKind: Send + Sync {
    type Output: DeserializeOwned + Default + Send;

    /// Combined prompt for one chunk, embedding each item's id.
    fn build_request(&self, items: &[BatchItem]) -> String;

    /// Conservative per-item result used when the chunk response is malformed.
    fn heuristic(&self, item: &BatchItem) -> Self::Output;

    /// Post-process a provider-supplied output (e.g. entity dedupe).
    fn normalize(&self, output: Self::Output) -> Self::Output {
        output
    }
}

/// Where an item's value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOrigin {
    /// Demultiplexed from the provider response by id.
    Provider,
    /// Id missing (or entry malformed) in an otherwise parsable response.
    Default,
    /// Whole chunk unusable; heuristic applied.
    Heuristic,
}

/// Per-item result of a batch run.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemResult<R> {
    pub id: String,
    pub value: R,
    pub origin: ItemOrigin,
}

/// Merges items into chunked provider calls and demultiplexes the responses.
#[derive(Debug)]
pub struct BatchAggregator<K: BatchKind> {
    kind: K,
    provider: Arc<dyn BatchProvider>,
    retry: RetryExecutor,
    service: String,
    chunk_size: usize,
}

/// Default items per combined provider call.
pub const DEFAULT_CHUNK_SIZE: usize = 5;

impl<K: BatchKind> BatchAggregator<K> {
    pub fn new(
        kind: K,
        provider: Arc<dyn BatchProvider>,
        retry: RetryExecutor,
        service: impl Into<String>,
    ) -> Self {
        Self { kind, provider, retry, service: service.into(), chunk_size: DEFAULT_CHUNK_SIZE }
    }

    /// Items per combined call (minimum 1).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Process all items, returning exactly one result per item, in input
    /// order.
    pub async fn process(&self, items: Vec<BatchItem>) -> Vec<ItemResult<K::Output>> {
        let mut results = Vec::with_capacity(items.len());
        for chunk in items.chunks(self.chunk_size) {
            results.extend(self.process_chunk(chunk).await);
        }
        results
    }

    async fn process_chunk(&self, chunk: &[BatchItem]) -> Vec<ItemResult<K::Output>> {
        let prompt = self.kind.build_request(chunk);
        let provider = self.provider.clone();
        let call = self
            .retry
            .execute(&self.service, "batch-chunk", || {
                let provider = provider.clone();
                let prompt = prompt.clone();
                async move { provider.call(&prompt).await }
            })
            .await;

        let raw = match call {
            Ok(retried) => retried.value,
            Err(err) => {
                tracing::warn!(
                    service = %self.service,
                    error = %err,
                    items = chunk.len(),
                    "batched provider call failed, applying per-item heuristics"
                );
                return self.heuristic_chunk(chunk);
            }
        };

        match parse_lenient(&raw) {
            Ok(parsed) => self.demux(chunk, parsed.value),
            Err(err) => {
                tracing::warn!(
                    service = %self.service,
                    error = %err,
                    "unparsable batch response, applying per-item heuristics"
                );
                self.heuristic_chunk(chunk)
            }
        }
    }

    /// Match sub-results back to items strictly by id.
    fn demux(&self, chunk: &[BatchItem], response: Value) -> Vec<ItemResult<K::Output>> {
        let entries = match response.get("results").and_then(Value::as_array) {
            Some(array) => Some(array),
            None => response.as_array(),
        };
        let Some(entries) = entries else {
            // Parsable JSON but not the expected shape
            return self.heuristic_chunk(chunk);
        };

        let mut by_id: HashMap<&str, &Value> = HashMap::new();
        for entry in entries {
            if let Some(id) = entry.get("id").and_then(Value::as_str) {
                by_id.entry(id).or_insert(entry);
            }
        }

        chunk
            .iter()
            .map(|item| {
                let value = by_id
                    .get(item.id.as_str())
                    .and_then(|entry| entry.get("result"))
                    .and_then(|raw| serde_json::from_value::<K::Output>(raw.clone()).ok());
                match value {
                    Some(output) => ItemResult {
                        id: item.id.clone(),
                        value: self.kind.normalize(output),
                        origin: ItemOrigin::Provider,
                    },
                    None => ItemResult {
                        id: item.id.clone(),
                        value: K::Output::default(),
                        origin: ItemOrigin::Default,
                    },
                }
            })
            .collect()
    }

    fn heuristic_chunk(&self, chunk: &[BatchItem]) -> Vec<ItemResult<K::Output>> {
        chunk
            .iter()
            .map(|item| ItemResult {
                id: item.id.clone(),
                value: self.kind.normalize(self.kind.heuristic(item)),
                origin: ItemOrigin::Heuristic,
            })
            .collect()
    }
}

/// Drop repeated entities, comparing case- and whitespace-insensitively.
/// First occurrence wins and keeps its original form.
pub fn dedupe_entities(entities: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(entities.len());
    for entity in entities {
        let key: String = entity.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        if seen.insert(key) {
            out.push(entity);
        }
    }
    out
}

/// Speaker-name extraction from event descriptions.
#[derive(Debug, Clone, Default)]
pub struct SpeakerExtraction;

impl BatchKind for SpeakerExtraction {
    type Output = Vec<String>;

    fn build_request(&self, items: &[BatchItem]) -> String {
        let mut prompt = String::from(
            "Extract the speaker names from each event description below. \
             Respond with a JSON array of {\"id\", \"result\"} objects where \
             result is an array of full names.\n\n",
        );
        for item in items {
            prompt.push_str(&format!("[{}] {}\n", item.id, item.text));
        }
        prompt
    }

    /// Capitalized-word-run scan: crude, but never fabricates beyond the text.
    fn heuristic(&self, item: &BatchItem) -> Vec<String> {
        let words: Vec<&str> = item.text.split_whitespace().collect();
        let mut names = Vec::new();
        let mut run: Vec<&str> = Vec::new();
        for word in words.iter().chain(std::iter::once(&"")) {
            let cleaned = word.trim_matches(|c: char| !c.is_alphanumeric());
            let capitalized = cleaned.chars().next().is_some_and(|c| c.is_uppercase())
                && cleaned.chars().skip(1).all(|c| c.is_lowercase());
            if capitalized {
                run.push(cleaned);
            } else {
                if run.len() >= 2 {
                    names.push(run.join(" "));
                }
                run.clear();
            }
        }
        names
    }

    fn normalize(&self, output: Vec<String>) -> Vec<String> {
        dedupe_entities(output)
    }
}

/// Relevance scoring for event prioritization, in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct EventPrioritization {
    keywords: Vec<String>,
}

impl EventPrioritization {
    pub fn new(keywords: Vec<String>) -> Self {
        Self { keywords: keywords.into_iter().map(|k| k.to_lowercase()).collect() }
    }
}

impl Default for EventPrioritization {
    fn default() -> Self {
        Self::new(
            ["conference", "summit", "keynote", "speaker", "agenda", "registration"]
                .map(String::from)
                .to_vec(),
        )
    }
}

impl BatchKind for EventPrioritization {
    type Output = f64;

    fn build_request(&self, items: &[BatchItem]) -> String {
        let mut prompt = String::from(
            "Score each event description below for business-event relevance \
             between 0 and 1. Respond with a JSON array of {\"id\", \"result\"} \
             objects where result is the score.\n\n",
        );
        for item in items {
            prompt.push_str(&format!("[{}] {}\n", item.id, item.text));
        }
        prompt
    }

    /// Fraction of configured keywords present in the text.
    fn heuristic(&self, item: &BatchItem) -> f64 {
        if self.keywords.is_empty() {
            return 0.0;
        }
        let lowered = item.text.to_lowercase();
        let hits = self.keywords.iter().filter(|k| lowered.contains(k.as_str())).count();
        hits as f64 / self.keywords.len() as f64
    }

    fn normalize(&self, output: f64) -> f64 {
        output.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsStore;
    use crate::sleeper::InstantSleeper;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug)]
    struct ScriptedProvider {
        responses: Mutex<Vec<Result<String, String>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<Result<String, String>>) -> Arc<Self> {
            Arc::new(Self { responses: Mutex::new(responses), calls: AtomicUsize::new(0) })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BatchProvider for ScriptedProvider {
        async fn call(&self, _prompt: &str) -> Result<String, BatchProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(BatchProviderError("script exhausted".into()));
            }
            responses.remove(0).map_err(BatchProviderError)
        }
    }

    fn retry() -> RetryExecutor {
        RetryExecutor::new(Arc::new(MetricsStore::default())).with_sleeper(InstantSleeper)
    }

    fn items(n: usize) -> Vec<BatchItem> {
        (0..n).map(|i| BatchItem::new(format!("e{}", i), format!("Event number {}", i))).collect()
    }

    fn aggregator(
        provider: Arc<ScriptedProvider>,
        chunk_size: usize,
    ) -> BatchAggregator<SpeakerExtraction> {
        BatchAggregator::new(SpeakerExtraction, provider, retry(), "llm")
            .with_chunk_size(chunk_size)
    }

    #[tokio::test]
    async fn demux_matches_by_id_not_position() {
        // Response deliberately reordered relative to the input
        let provider = ScriptedProvider::new(vec![Ok(r#"[
            {"id": "e1", "result": ["Bob Beta"]},
            {"id": "e0", "result": ["Alice Alpha"]},
            {"id": "e2", "result": ["Carol Gamma"]}
        ]"#
        .to_string())]);
        let results = aggregator(provider, 10).process(items(3)).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].id, "e0");
        assert_eq!(results[0].value, vec!["Alice Alpha".to_string()]);
        assert_eq!(results[1].value, vec!["Bob Beta".to_string()]);
        assert_eq!(results[2].value, vec!["Carol Gamma".to_string()]);
        assert!(results.iter().all(|r| r.origin == ItemOrigin::Provider));
    }

    #[tokio::test]
    async fn omitted_id_yields_default_not_error() {
        // Provider drops e1 entirely
        let provider = ScriptedProvider::new(vec![Ok(r#"{"results": [
            {"id": "e0", "result": ["Alice Alpha"]},
            {"id": "e2", "result": ["Carol Gamma"]}
        ]}"#
        .to_string())]);
        let results = aggregator(provider, 10).process(items(3)).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[1].id, "e1");
        assert!(results[1].value.is_empty());
        assert_eq!(results[1].origin, ItemOrigin::Default);
        assert_eq!(results[0].origin, ItemOrigin::Provider);
    }

    #[tokio::test]
    async fn malformed_chunk_falls_back_to_heuristics() {
        let provider = ScriptedProvider::new(vec![Ok("I cannot answer that.".to_string())]);
        let input = vec![
            BatchItem::new("e0", "Keynote by Jane Doe and John Smith at the summit"),
            BatchItem::new("e1", "no names here at all"),
        ];
        let results = aggregator(provider, 10).process(input).await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.origin == ItemOrigin::Heuristic));
        assert!(results[0].value.contains(&"Jane Doe".to_string()));
        assert!(results[0].value.contains(&"John Smith".to_string()));
        assert!(results[1].value.is_empty());
    }

    #[tokio::test]
    async fn provider_failure_after_retries_falls_back_to_heuristics() {
        // Both the first call and its retries fail
        let provider = ScriptedProvider::new(vec![
            Err("connection reset".to_string()),
            Err("connection reset".to_string()),
            Err("connection reset".to_string()),
            Err("connection reset".to_string()),
        ]);
        let results = aggregator(provider.clone(), 10)
            .process(vec![BatchItem::new("e0", "Talk by Grace Hopper")])
            .await;

        // Default config: 3 retries + 1 initial attempt
        assert_eq!(provider.calls(), 4);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].origin, ItemOrigin::Heuristic);
        assert_eq!(results[0].value, vec!["Grace Hopper".to_string()]);
    }

    #[tokio::test]
    async fn transient_provider_failure_is_retried_within_a_chunk() {
        let provider = ScriptedProvider::new(vec![
            Err("429 rate limit".to_string()),
            Ok(r#"[{"id": "e0", "result": ["Ada Lovelace"]}]"#.to_string()),
        ]);
        let results = aggregator(provider.clone(), 10).process(items(1)).await;

        assert_eq!(provider.calls(), 2);
        assert_eq!(results[0].origin, ItemOrigin::Provider);
        assert_eq!(results[0].value, vec!["Ada Lovelace".to_string()]);
    }

    #[tokio::test]
    async fn chunking_makes_one_call_per_chunk() {
        let provider = ScriptedProvider::new(vec![
            Ok("[]".to_string()),
            Ok("[]".to_string()),
            Ok("[]".to_string()),
        ]);
        let results = aggregator(provider.clone(), 2).process(items(5)).await;

        assert_eq!(provider.calls(), 3); // 2 + 2 + 1
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.origin == ItemOrigin::Default));
    }

    #[tokio::test]
    async fn fenced_response_is_repaired_before_demux() {
        let provider = ScriptedProvider::new(vec![Ok(
            "```json\n[{\"id\": \"e0\", \"result\": [\"Alan Turing\"]}]\n```".to_string(),
        )]);
        let results = aggregator(provider, 10).process(items(1)).await;
        assert_eq!(results[0].origin, ItemOrigin::Provider);
        assert_eq!(results[0].value, vec!["Alan Turing".to_string()]);
    }

    #[tokio::test]
    async fn provider_entities_are_deduped_first_wins() {
        let provider = ScriptedProvider::new(vec![Ok(r#"[{"id": "e0", "result":
            ["Jane Doe", "jane  doe", "JANE DOE", "John Smith"]}]"#
            .to_string())]);
        let results = aggregator(provider, 10).process(items(1)).await;
        assert_eq!(results[0].value, vec!["Jane Doe".to_string(), "John Smith".to_string()]);
    }

    #[test]
    fn dedupe_is_case_and_whitespace_insensitive() {
        let deduped = dedupe_entities(vec![
            "Jane Doe".to_string(),
            " jane   doe ".to_string(),
            "John Smith".to_string(),
            "JOHN SMITH".to_string(),
        ]);
        assert_eq!(deduped, vec!["Jane Doe".to_string(), "John Smith".to_string()]);
    }

    #[tokio::test]
    async fn prioritization_heuristic_scores_keyword_fraction() {
        let provider = ScriptedProvider::new(vec![Ok("garbage".to_string())]);
        let aggregator =
            BatchAggregator::new(EventPrioritization::default(), provider, retry(), "llm");
        let results = aggregator
            .process(vec![
                BatchItem::new("e0", "Annual FinTech Summit with keynote and agenda"),
                BatchItem::new("e1", "completely unrelated text"),
            ])
            .await;

        assert!(results[0].value > 0.0);
        assert_eq!(results[1].value, 0.0);
        assert!(results.iter().all(|r| r.origin == ItemOrigin::Heuristic));
    }

    #[tokio::test]
    async fn prioritization_scores_are_clamped() {
        let provider = ScriptedProvider::new(vec![Ok(
            r#"[{"id": "e0", "result": 3.5}, {"id": "e1", "result": -2.0}]"#.to_string(),
        )]);
        let aggregator =
            BatchAggregator::new(EventPrioritization::default(), provider, retry(), "llm");
        let results = aggregator.process(items(2)).await;
        assert_eq!(results[0].value, 1.0);
        assert_eq!(results[1].value, 0.0);
    }

    #[test]
    fn build_request_embeds_every_id() {
        let prompt = SpeakerExtraction.build_request(&items(3));
        assert!(prompt.contains("[e0]"));
        assert!(prompt.contains("[e1]"));
        assert!(prompt.contains("[e2]"));
    }
}
