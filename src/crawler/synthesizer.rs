//! Derivation of shared-attribute edges from stored metadata
//!
//! Synthesis reads only what is already stored and issues no requests. It is
//! deterministic for a given store state and safe to repeat, since edge
//! upserts are idempotent per kind and pair.
//!
//! Stub resolution is the one networked step: stub nodes (known only through
//! an edge) get their grouping attributes from batched id-filtered searches,
//! one request per batch.

use crate::api::{RetryError, RetryingClient, SampleApi, SearchQuery};
use crate::config::SynthesisConfig;
use crate::model::{EdgeKind, NodeId, SampleAttributes};
use crate::storage::{MetadataStore, StorageResult, TopologyStore};
use std::collections::{BTreeMap, BTreeSet};

/// Fields requested when resolving stubs
pub const STUB_FIELDS: [&str; 5] = ["id", "username", "pack", "tags", "name"];

/// Counts of one synthesis run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SynthesisReport {
    /// Nodes with metadata that took part
    pub nodes_considered: usize,
    pub shared_user: usize,
    pub shared_pack: usize,
    pub shared_tag: usize,
    /// Groups not expanded because they exceeded the size limit
    pub skipped_groups: usize,
}

impl SynthesisReport {
    /// Total edges created by this run
    pub fn new_edges(&self) -> usize {
        self.shared_user + self.shared_pack + self.shared_tag
    }
}

/// Counts of one stub resolution pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveReport {
    pub stubs: usize,
    pub resolved: usize,
    pub batches: usize,
    pub failed_batches: usize,
    /// Stopped early by the budget or the stop signal
    pub interrupted: bool,
}

/// Shared-attribute edge synthesizer
#[derive(Debug, Clone)]
pub struct EdgeSynthesizer {
    tag_threshold: f64,
    max_group_size: usize,
    resolve_batch_size: usize,
}

impl EdgeSynthesizer {
    pub fn new(tag_threshold: f64, max_group_size: usize, resolve_batch_size: usize) -> Self {
        Self {
            tag_threshold,
            max_group_size,
            resolve_batch_size: resolve_batch_size.max(1),
        }
    }

    pub fn from_config(config: &SynthesisConfig) -> Self {
        Self::new(
            config.tag_threshold,
            config.max_group_size,
            config.resolve_batch_size,
        )
    }

    /// Derives shared-user, shared-pack and shared-tag edges
    ///
    /// Only nodes present in both stores take part.
    ///
    /// # Returns
    ///
    /// * `Ok(SynthesisReport)` - Counts of newly created edges
    /// * `Err(StorageError)` - Metadata could not be read
    pub fn synthesize(
        &self,
        metadata: &dyn MetadataStore,
        topology: &mut TopologyStore,
    ) -> StorageResult<SynthesisReport> {
        let mut report = SynthesisReport::default();

        let mut by_user: BTreeMap<String, Vec<NodeId>> = BTreeMap::new();
        let mut by_pack: BTreeMap<String, Vec<NodeId>> = BTreeMap::new();
        let mut tag_sets: Vec<(NodeId, BTreeSet<String>)> = Vec::new();

        for record in metadata.all_records()? {
            if !topology.contains(record.id) {
                continue;
            }
            report.nodes_considered += 1;

            if let Some(user) = user_key(&record.attributes) {
                by_user.entry(user).or_default().push(record.id);
            }
            if let Some(pack) = record.attributes.pack_key() {
                by_pack.entry(pack).or_default().push(record.id);
            }
            let tags = record.attributes.tag_set();
            if !tags.is_empty() {
                tag_sets.push((record.id, tags));
            }
        }

        report.shared_user = self.link_groups(&by_user, EdgeKind::SharedUser, topology, &mut report.skipped_groups)?;
        report.shared_pack = self.link_groups(&by_pack, EdgeKind::SharedPack, topology, &mut report.skipped_groups)?;
        report.shared_tag = self.link_tags(&tag_sets, topology, &mut report.skipped_groups)?;

        tracing::info!(
            nodes = report.nodes_considered,
            shared_user = report.shared_user,
            shared_pack = report.shared_pack,
            shared_tag = report.shared_tag,
            skipped_groups = report.skipped_groups,
            "Edge synthesis complete"
        );

        Ok(report)
    }

    /// Connects every pair inside each group
    fn link_groups(
        &self,
        groups: &BTreeMap<String, Vec<NodeId>>,
        kind: EdgeKind,
        topology: &mut TopologyStore,
        skipped: &mut usize,
    ) -> StorageResult<usize> {
        let mut created = 0;

        for (key, members) in groups {
            if members.len() < 2 {
                continue;
            }
            if members.len() > self.max_group_size {
                tracing::debug!(kind = kind.as_str(), group = %key, size = members.len(), "Skipping oversized group");
                *skipped += 1;
                continue;
            }

            for (i, a) in members.iter().enumerate() {
                for b in &members[i + 1..] {
                    if topology.upsert_edge(*a, *b, kind, None)? {
                        created += 1;
                    }
                }
            }
        }

        Ok(created)
    }

    /// Connects pairs whose tag sets reach the Jaccard threshold
    ///
    /// Candidate pairs come from an inverted tag index, so only nodes sharing
    /// at least one tag of a non-oversized group are compared.
    fn link_tags(
        &self,
        tag_sets: &[(NodeId, BTreeSet<String>)],
        topology: &mut TopologyStore,
        skipped: &mut usize,
    ) -> StorageResult<usize> {
        let mut index: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (position, (_, tags)) in tag_sets.iter().enumerate() {
            for tag in tags {
                index.entry(tag.as_str()).or_default().push(position);
            }
        }

        let mut candidates: BTreeSet<(usize, usize)> = BTreeSet::new();
        for (tag, positions) in &index {
            if positions.len() > self.max_group_size {
                tracing::debug!(tag = %tag, size = positions.len(), "Skipping oversized tag group");
                *skipped += 1;
                continue;
            }
            for (i, a) in positions.iter().enumerate() {
                for b in &positions[i + 1..] {
                    candidates.insert((*a, *b));
                }
            }
        }

        let mut created = 0;
        for (a, b) in candidates {
            let (id_a, tags_a) = &tag_sets[a];
            let (id_b, tags_b) = &tag_sets[b];
            let similarity = jaccard(tags_a, tags_b);
            if similarity >= self.tag_threshold
                && topology.upsert_edge(*id_a, *id_b, EdgeKind::SharedTag, Some(similarity))?
            {
                created += 1;
            }
        }

        Ok(created)
    }

    /// Fetches grouping attributes for stub nodes without metadata
    ///
    /// # Arguments
    ///
    /// * `api` - Remote API
    /// * `client` - Retry and rate-limit wrapper; its ledger is charged
    /// * `metadata` - Receives the resolved records, one transaction per batch
    /// * `topology` - Source of stub ids
    /// * `max_requests` - Requests this pass may spend
    pub async fn resolve_stubs(
        &self,
        api: &dyn SampleApi,
        client: &mut RetryingClient,
        metadata: &mut dyn MetadataStore,
        topology: &TopologyStore,
        max_requests: u64,
    ) -> StorageResult<ResolveReport> {
        let mut stubs = Vec::new();
        for id in topology.stub_ids() {
            if !metadata.contains(id)? {
                stubs.push(id);
            }
        }

        let mut report = ResolveReport {
            stubs: stubs.len(),
            ..Default::default()
        };
        let start = client.ledger().attempts();
        client.set_request_limit(Some(max_requests));

        for batch in stubs.chunks(self.resolve_batch_size) {
            if client.ledger().attempts() - start >= max_requests {
                tracing::info!(resolved = report.resolved, "Request budget reached during stub resolution");
                report.interrupted = true;
                break;
            }

            let query = SearchQuery::new("")
                .with_filter(SearchQuery::id_filter(batch))
                .with_fields(&STUB_FIELDS)
                .with_page_size(batch.len() as u32);

            report.batches += 1;
            let page = match client.call("resolve_stubs", || api.search(&query)).await {
                Ok(fetched) => fetched.into_option().unwrap_or_default(),
                Err(RetryError::Cancelled | RetryError::BudgetExhausted) => {
                    report.interrupted = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(batch = batch.len(), error = %e, "Stub batch failed, leaving unresolved");
                    report.failed_batches += 1;
                    continue;
                }
            };

            let wanted: BTreeSet<NodeId> = batch.iter().copied().collect();
            let records: Vec<(NodeId, SampleAttributes)> = page
                .results
                .into_iter()
                .filter(|record| wanted.contains(&record.id))
                .map(|record| (record.id, record.attributes))
                .collect();

            metadata.batch_upsert_nodes(&records)?;
            report.resolved += records.len();
        }

        tracing::info!(
            stubs = report.stubs,
            resolved = report.resolved,
            batches = report.batches,
            "Stub resolution finished"
        );

        Ok(report)
    }
}

fn user_key(attributes: &SampleAttributes) -> Option<String> {
    attributes
        .username
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
}

/// Jaccard similarity of two tag sets
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}
