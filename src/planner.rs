use crate::config::SessionConfig;
use crate::driver::{ScanInfo, ScanMode};
use crate::metadata::MetadataCache;
use crate::value::FedValue;

/// Decomposition mode (spec §4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialReadMode {
    None,
    Shard,
    Range,
    ShardRange,
}

/// Hint tokens parsed from a statement comment (spec §4.F step 2). Tokens
/// independently set workload mode and partial-read mode; unrecognized
/// tokens are ignored rather than rejected, matching the spec's "compact
/// set of tokens" wording without scope for a parser error.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParsedHint {
    pub workload: Option<ScanMode>,
    pub mode: Option<PartialReadMode>,
}

pub fn parse_hint(text: &str) -> ParsedHint {
    let mut hint = ParsedHint::default();
    for token in text.split_whitespace() {
        match token {
            "oltp" => hint.workload = Some(ScanMode::Oltp),
            "olap" => hint.workload = Some(ScanMode::Olap),
            "sd_rd" | "sd_tp_rd" | "sd_ap_rd" => hint.mode = Some(PartialReadMode::Shard),
            "rg_rd" | "rg_tp_rd" | "rg_ap_rd" => hint.mode = Some(PartialReadMode::Range),
            "rg_sd_rd" | "rg_sd_tp_rd" | "rg_sd_ap_rd" => hint.mode = Some(PartialReadMode::ShardRange),
            "full_rd" | "full_tp_rd" | "full_ap_rd" => hint.mode = Some(PartialReadMode::None),
            _ => {}
        }
        match token {
            "sd_tp_rd" | "rg_tp_rd" | "rg_sd_tp_rd" | "full_tp_rd" => hint.workload = Some(ScanMode::Oltp),
            "sd_ap_rd" | "rg_ap_rd" | "rg_sd_ap_rd" | "full_ap_rd" => hint.workload = Some(ScanMode::Olap),
            _ => {}
        }
    }
    hint
}

/// Inputs the decision in spec §4.F step 4-6 needs: cost-estimate and
/// capability signals gathered from `config`/`MetadataCache`/the statement.
pub struct PlanInputs<'a> {
    pub config: &'a SessionConfig,
    pub metadata: &'a MetadataCache,
    pub hint: Option<ParsedHint>,
    pub table_forces_partial_read: bool,
    pub estimated_rows: u64,
    pub active_limit: Option<u64>,
    pub join_breadth: u64,
    pub has_equality_predicate: bool,
    pub session_preference: PartialReadMode,
}

/// Chooses a decomposition mode per spec §4.F's six numbered steps.
pub fn choose_mode(inputs: &PlanInputs) -> PartialReadMode {
    if !inputs.config.partial_read_enabled {
        return PartialReadMode::None;
    }

    if let Some(hint) = inputs.hint {
        if let Some(mode) = hint.mode {
            return clamp_to_capability(mode, inputs);
        }
    }

    let forced_candidate_allowed = inputs.table_forces_partial_read;

    let limit_pressure = inputs
        .active_limit
        .map(|limit| limit.saturating_mul(inputs.join_breadth.max(1)) < inputs.estimated_rows)
        .unwrap_or(false);
    let size_pressure = inputs.estimated_rows > inputs.config.small_table_threshold;

    let wants_partial = forced_candidate_allowed
        || ((size_pressure || limit_pressure) && !inputs.has_equality_predicate);

    if !wants_partial {
        return PartialReadMode::None;
    }

    clamp_to_capability(inputs.session_preference, inputs)
}

/// Capability filter (spec §4.F step 5): SHARD needs a finite shard count
/// greater than one; RANGE needs a cached sharding column and boundaries.
fn clamp_to_capability(preferred: PartialReadMode, inputs: &PlanInputs) -> PartialReadMode {
    let shard_capable = matches!(inputs.metadata.shard_topology.shard_count(), Some(n) if n > 1);
    let range_capable = inputs.metadata.range_info.column.is_some() && !inputs.metadata.range_info.boundaries.is_empty();

    match preferred {
        PartialReadMode::Shard if shard_capable => PartialReadMode::Shard,
        PartialReadMode::Range if range_capable => PartialReadMode::Range,
        PartialReadMode::ShardRange if shard_capable && range_capable => PartialReadMode::ShardRange,
        PartialReadMode::ShardRange if range_capable => PartialReadMode::Range,
        PartialReadMode::ShardRange if shard_capable => PartialReadMode::Shard,
        PartialReadMode::None => PartialReadMode::None,
        _ => {
            // Preferred mode isn't capability-backed: fall back to whichever
            // of the two remains possible, else a full scan.
            if shard_capable && range_capable {
                PartialReadMode::ShardRange
            } else if shard_capable {
                PartialReadMode::Shard
            } else if range_capable {
                PartialReadMode::Range
            } else {
                PartialReadMode::None
            }
        }
    }
}

/// One sub-query segment of a partial-read plan (spec §4.F "Scan
/// execution").
#[derive(Debug, Clone)]
pub struct ScanSegment {
    pub shard: Option<String>,
    pub range_predicate: Option<String>,
}

/// Builds the ordered list of sub-queries for a chosen mode, combined with
/// the original pushed-down filter. Range boundaries must be pre-sorted
/// ascending, per spec §4.F.
pub fn build_segments(
    mode: PartialReadMode,
    shards: &[String],
    range_column: Option<&str>,
    boundaries: &[FedValue],
) -> Vec<ScanSegment> {
    match mode {
        PartialReadMode::None => vec![ScanSegment { shard: None, range_predicate: None }],
        PartialReadMode::Shard => shards
            .iter()
            .map(|s| ScanSegment { shard: Some(s.clone()), range_predicate: None })
            .collect(),
        PartialReadMode::Range => range_segments(range_column, boundaries)
            .into_iter()
            .map(|predicate| ScanSegment { shard: None, range_predicate: Some(predicate) })
            .collect(),
        PartialReadMode::ShardRange => {
            let ranges = range_segments(range_column, boundaries);
            let mut out = Vec::with_capacity(shards.len() * ranges.len().max(1));
            for shard in shards {
                for predicate in &ranges {
                    out.push(ScanSegment {
                        shard: Some(shard.clone()),
                        range_predicate: Some(predicate.clone()),
                    });
                }
            }
            out
        }
    }
}

fn range_segments(column: Option<&str>, boundaries: &[FedValue]) -> Vec<String> {
    let col = match column {
        Some(c) => crate::translator::quote_identifier(c),
        None => return vec!["1=1".to_string()],
    };
    if boundaries.is_empty() {
        return vec!["1=1".to_string()];
    }
    let mut segments = Vec::with_capacity(boundaries.len() + 1);
    segments.push(format!("{} <= {}", col, boundaries[0].to_sql_literal()));
    for i in 1..boundaries.len() {
        segments.push(format!(
            "{} > {} AND {} <= {}",
            col,
            boundaries[i - 1].to_sql_literal(),
            col,
            boundaries[i].to_sql_literal()
        ));
    }
    segments.push(format!("{} > {}", col, boundaries[boundaries.len() - 1].to_sql_literal()));
    segments
}

/// Drives the handler's `rnd_next` loop transparently across sub-queries
/// (spec §4.F "Scan execution" / §4.H `rnd_next`): tracks which segment is
/// current and whether another remains once the active one is exhausted.
pub struct ScanPlan {
    segments: Vec<ScanSegment>,
    current: usize,
    base_query: String,
    lock_suffix: String,
}

impl ScanPlan {
    pub fn new(segments: Vec<ScanSegment>, base_query: &str, lock_suffix: &str) -> Self {
        ScanPlan {
            segments,
            current: 0,
            base_query: base_query.to_string(),
            lock_suffix: lock_suffix.to_string(),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.current >= self.segments.len()
    }

    /// Returns the SQL for the current segment and the routing `ScanInfo`
    /// the driver needs to reach the right shard, or `None` past the end.
    pub fn current_query(&self, extra_filter: Option<&str>) -> Option<(String, ScanInfo)> {
        let segment = self.segments.get(self.current)?;
        let mut sql = self.base_query.clone();
        let mut predicates = Vec::new();
        if let Some(rp) = &segment.range_predicate {
            predicates.push(rp.clone());
        }
        if let Some(filter) = extra_filter {
            predicates.push(filter.to_string());
        }
        if !predicates.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&predicates.join(" AND "));
        }
        sql.push_str(&self.lock_suffix);
        Some((sql, ScanInfo { shard: segment.shard.clone() }))
    }

    /// Advances to the next segment; returns `true` if one exists.
    pub fn advance(&mut self) -> bool {
        self.current += 1;
        !self.is_exhausted()
    }
}
