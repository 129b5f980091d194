// src/detector.rs
//! Detection pipeline: keyword + similarity scoring, threshold policy, optional
//! AI escalation, stats recording.
//!
//! `Scoring -> Accepted | Escalating -> Accepted | Fallback`. Every path that
//! returns a result queues exactly one stats record; validation failures queue
//! nothing.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ai::{AiClient, AiSelection, CategoryRef, EscalationError};
use crate::config::DetectionConfig;
use crate::error::DetectionError;
use crate::feedback::FeedbackRecorder;
use crate::index::{IndexSnapshot, KeywordIndex};
use crate::model::{
    clamp01, AlternativeCategory, DetectionInput, DetectionMethod, DetectionResult,
    DetectionStats, DetectionWarning, StatsId,
};
use crate::scoring::{rank_candidates, Candidate, KeywordScorer, SimilarityScorer};
use crate::text::{input_hash, TokenSet};

/// Where the threshold policy put the local result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalDecision {
    Accepted,
    Ambiguous,
    Fallback,
}

/// Outcome of local scoring, before any escalation.
struct Local {
    snapshot: Arc<IndexSnapshot>,
    candidates: Vec<Candidate>,
    method: DetectionMethod,
    decision: LocalDecision,
}

pub struct Detector {
    cfg: DetectionConfig,
    index: KeywordIndex,
    keywords: KeywordScorer,
    similarity: SimilarityScorer,
    ai: AiClient,
    recorder: FeedbackRecorder,
}

impl Detector {
    pub fn new(
        cfg: DetectionConfig,
        index: KeywordIndex,
        similarity: SimilarityScorer,
        ai: AiClient,
        recorder: FeedbackRecorder,
    ) -> Self {
        Self {
            cfg,
            index,
            keywords: KeywordScorer::new(),
            similarity,
            ai,
            recorder,
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.cfg
    }

    pub fn index(&self) -> &KeywordIndex {
        &self.index
    }

    pub fn ai(&self) -> &AiClient {
        &self.ai
    }

    pub fn recorder(&self) -> &FeedbackRecorder {
        &self.recorder
    }

    /// Local scoring only; the ambiguous band returns the best local candidate.
    pub async fn detect_category(&self, input: &DetectionInput) -> Result<DetectionResult, DetectionError> {
        let started = Instant::now();
        validate(input)?;
        let local = self.score_local(input).await;
        let result = self.local_result(&local, None, started);
        Ok(self.finish(input, result, false))
    }

    /// Full pipeline with escalation in the ambiguous band.
    pub async fn detect_with_ai_fallback(
        &self,
        input: &DetectionInput,
    ) -> Result<DetectionResult, DetectionError> {
        self.detect_with_ai_fallback_cancellable(input, &CancellationToken::new())
            .await
    }

    /// As `detect_with_ai_fallback`; cancelling `cancel` abandons the AI call and
    /// returns the local result.
    pub async fn detect_with_ai_fallback_cancellable(
        &self,
        input: &DetectionInput,
        cancel: &CancellationToken,
    ) -> Result<DetectionResult, DetectionError> {
        let started = Instant::now();
        validate(input)?;
        let local = self.score_local(input).await;

        if local.decision != LocalDecision::Ambiguous {
            let result = self.local_result(&local, None, started);
            return Ok(self.finish(input, result, false));
        }

        let refs: Vec<CategoryRef> = local
            .candidates
            .iter()
            .map(|c| CategoryRef {
                id: c.category_id,
                name: c.name.clone(),
                slug: c.slug.clone(),
            })
            .collect();

        match self.ai.select_category(input, &refs, cancel).await {
            Ok(sel) => {
                counter!("detection_escalations_total", "outcome" => "success").increment(1);
                let result = self.ai_result(&local, sel, DetectionMethod::AiFallback, started);
                Ok(self.finish(input, result, true))
            }
            Err(e) => {
                let attempted = self.note_escalation_failure(input, &e);
                let warning = attempted.then_some(DetectionWarning::EscalationFailed);
                let result = self.local_result(&local, warning, started);
                Ok(self.finish(input, result, attempted))
            }
        }
    }

    /// Let the model choose from every active category, skipping local scoring.
    /// Failures fall back to the local pipeline without escalation.
    pub async fn select_category_directly(
        &self,
        input: &DetectionInput,
    ) -> Result<DetectionResult, DetectionError> {
        self.select_category_directly_cancellable(input, &CancellationToken::new())
            .await
    }

    pub async fn select_category_directly_cancellable(
        &self,
        input: &DetectionInput,
        cancel: &CancellationToken,
    ) -> Result<DetectionResult, DetectionError> {
        let started = Instant::now();
        validate(input)?;
        let snapshot = self.index.snapshot();
        let refs: Vec<CategoryRef> = snapshot
            .active_categories()
            .filter(|c| c.id != self.cfg.other_category_id)
            .map(|c| CategoryRef {
                id: c.id,
                name: c.name.clone(),
                slug: c.slug.clone(),
            })
            .collect();

        match self.ai.select_category(input, &refs, cancel).await {
            Ok(sel) => {
                counter!("detection_escalations_total", "outcome" => "success").increment(1);
                let local = Local {
                    snapshot,
                    candidates: Vec::new(),
                    method: DetectionMethod::DirectAi,
                    decision: LocalDecision::Accepted,
                };
                let result = self.ai_result(&local, sel, DetectionMethod::DirectAi, started);
                Ok(self.finish(input, result, true))
            }
            Err(e) => {
                let attempted = self.note_escalation_failure(input, &e);
                let local = self.score_local(input).await;
                let warning = attempted.then_some(DetectionWarning::EscalationFailed);
                let result = self.local_result(&local, warning, started);
                Ok(self.finish(input, result, attempted))
            }
        }
    }

    async fn score_local(&self, input: &DetectionInput) -> Local {
        let snapshot = self.index.snapshot();
        let language = self.language_of(input);

        let mut texts: Vec<&str> = vec![input.title.as_str(), input.description.as_str()];
        texts.extend(input.attributes.values().map(String::as_str));
        let tokens = TokenSet::build(&texts, &input.keywords, self.cfg.min_token_len);
        let sim_text = input.similarity_text();

        let (kw, sim) = tokio::join!(
            async { self.keywords.score(&snapshot, &language, &tokens) },
            self.similarity
                .score(&snapshot, &language, &sim_text, self.cfg.other_category_id),
        );

        let (sim, method) = match sim {
            Ok(s) => (s, DetectionMethod::KeywordSimilarity),
            Err(e) => {
                warn!(
                    target: "detector",
                    input_id = %input_hash(&sim_text),
                    error = %format!("{e:#}"),
                    "similarity scorer failed, keyword score only"
                );
                (Default::default(), DetectionMethod::Keyword)
            }
        };

        let candidates = rank_candidates(
            &snapshot,
            &kw,
            &sim,
            self.cfg.alpha,
            self.cfg.top_n,
            self.cfg.other_category_id,
        );

        let best = candidates.first().map_or(0.0, |c| c.combined);
        let decision = if candidates.is_empty() || best < self.cfg.low_threshold {
            LocalDecision::Fallback
        } else if best >= self.cfg.high_threshold {
            LocalDecision::Accepted
        } else {
            LocalDecision::Ambiguous
        };

        debug!(
            target: "detector",
            input_id = %input_hash(&sim_text),
            language = %language,
            generation = snapshot.generation(),
            candidates = candidates.len(),
            best,
            decision = ?decision,
            "scored"
        );

        Local {
            snapshot,
            candidates,
            method,
            decision,
        }
    }

    fn language_of(&self, input: &DetectionInput) -> String {
        let l = input.language.trim();
        if l.is_empty() {
            self.cfg.default_language.clone()
        } else {
            l.to_ascii_lowercase()
        }
    }

    fn alternatives<'a>(
        &self,
        candidates: impl Iterator<Item = &'a Candidate>,
        floor: f32,
    ) -> Vec<AlternativeCategory> {
        candidates
            .filter(|c| c.combined > floor)
            .take(self.cfg.max_alternatives)
            .map(|c| AlternativeCategory {
                category_id: c.category_id,
                category_name: c.name.clone(),
                category_slug: c.slug.clone(),
                confidence: clamp01(c.combined),
            })
            .collect()
    }

    fn local_result(
        &self,
        local: &Local,
        warning: Option<DetectionWarning>,
        started: Instant,
    ) -> DetectionResult {
        match (local.decision, local.candidates.first()) {
            (LocalDecision::Fallback, _) | (_, None) => self.fallback_result(local, started),
            (_, Some(top)) => DetectionResult {
                category_id: top.category_id,
                category_name: top.name.clone(),
                category_slug: top.slug.clone(),
                confidence: clamp01(top.combined),
                method: local.method,
                alternative_categories: self
                    .alternatives(local.candidates.iter().skip(1), self.cfg.alternative_floor),
                matched_keywords: top.matched.clone(),
                keyword_score: top.keyword_score,
                similarity_score: top.similarity_score,
                warning,
                stats_id: StatsId::new(),
                processing_time_ms: elapsed_ms(started),
            },
        }
    }

    /// Reserved "Other" with the best local guesses as alternatives.
    fn fallback_result(&self, local: &Local, started: Instant) -> DetectionResult {
        let other = self.cfg.other_category_id;
        let (name, slug) = local
            .snapshot
            .category(other)
            .map(|c| (c.name.clone(), c.slug.clone()))
            .unwrap_or_else(|| ("Other".to_string(), "other".to_string()));
        let best = local.candidates.first();
        DetectionResult {
            category_id: other,
            category_name: name,
            category_slug: slug,
            confidence: clamp01(best.map_or(0.0, |c| c.combined)),
            method: local.method,
            alternative_categories: self.alternatives(local.candidates.iter(), 0.0),
            matched_keywords: Vec::new(),
            keyword_score: best.map_or(0.0, |c| c.keyword_score),
            similarity_score: best.map_or(0.0, |c| c.similarity_score),
            warning: Some(DetectionWarning::LowConfidence),
            stats_id: StatsId::new(),
            processing_time_ms: elapsed_ms(started),
        }
    }

    fn ai_result(
        &self,
        local: &Local,
        sel: AiSelection,
        method: DetectionMethod,
        started: Instant,
    ) -> DetectionResult {
        let chosen = local
            .candidates
            .iter()
            .find(|c| c.category_id == sel.category_id);

        let mut alternatives = self.alternatives(
            local
                .candidates
                .iter()
                .filter(|c| c.category_id != sel.category_id),
            self.cfg.alternative_floor,
        );
        if alternatives.is_empty() {
            // direct selection: the model's own runner-ups
            alternatives = sel
                .alternative_ids
                .iter()
                .filter_map(|id| local.snapshot.category(*id))
                .take(self.cfg.max_alternatives)
                .map(|c| AlternativeCategory {
                    category_id: c.id,
                    category_name: c.name.clone(),
                    category_slug: c.slug.clone(),
                    confidence: 0.0,
                })
                .collect();
        }

        DetectionResult {
            category_id: sel.category_id,
            category_name: sel.category_name,
            category_slug: sel.category_slug,
            confidence: clamp01(sel.confidence),
            method,
            alternative_categories: alternatives,
            matched_keywords: chosen.map(|c| c.matched.clone()).unwrap_or_default(),
            keyword_score: chosen.map_or(0.0, |c| c.keyword_score),
            similarity_score: chosen.map_or(0.0, |c| c.similarity_score),
            warning: None,
            stats_id: StatsId::new(),
            processing_time_ms: elapsed_ms(started),
        }
    }

    /// Log + count a failed escalation. Returns whether a call was attempted.
    fn note_escalation_failure(&self, input: &DetectionInput, e: &EscalationError) -> bool {
        counter!("detection_escalations_total", "outcome" => e.outcome()).increment(1);
        let attempted = !matches!(e, EscalationError::Disabled);
        if attempted {
            warn!(
                target: "detector",
                input_id = %input_hash(&input.similarity_text()),
                provider = self.ai.provider_name(),
                error = %e,
                "escalation failed, using local result"
            );
        }
        attempted
    }

    fn finish(&self, input: &DetectionInput, result: DetectionResult, escalated: bool) -> DetectionResult {
        counter!("detections_total", "method" => result.method.as_str()).increment(1);
        if result.warning == Some(DetectionWarning::LowConfidence) {
            counter!("detection_fallbacks_total").increment(1);
        }
        histogram!("detection_latency_ms").record(result.processing_time_ms as f64);

        info!(
            target: "detector",
            input_id = %input_hash(&input.similarity_text()),
            stats_id = %result.stats_id,
            category_id = %result.category_id,
            confidence = result.confidence,
            method = %result.method,
            warning = ?result.warning,
            ms = result.processing_time_ms,
            "detected"
        );

        self.recorder
            .record(DetectionStats::from_result(input, &result, escalated));
        result
    }
}

fn validate(input: &DetectionInput) -> Result<(), DetectionError> {
    if input.is_empty() {
        return Err(DetectionError::Validation(
            "title, description or keywords required".into(),
        ));
    }
    Ok(())
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u64::MAX as u128) as u64
}

