//! Tree construction for one document.
//!
//! The orchestrator works strictly sequentially: a root is searched for over
//! the document's short answers, then the tree is extended depth first with
//! an explicit stack, one node and one keyword at a time. Every candidate
//! node carries a [`NodeLifecycle`]; every attempt ends in exactly one
//! terminal trajectory step. Cancellation is honoured at node boundaries and
//! a cancelled tree is still integrated and finalised.

use crate::brain::{Brain, LlmProvider};
use crate::circular::{CandidatePair, CircularDetector};
use crate::compliance::{
    ComplianceEnforcer, CompliancePhase, ComplianceReport, ComplianceStatus, ComplianceSubject,
};
use crate::composite::CompositeIntegrator;
use crate::config::DeepTreeConfig;
use crate::error::TreeError;
use crate::extension::{ExtensionEngine, ExtensionRequest, MAX_EXTENSION_ATTEMPTS};
use crate::generation::QuestionGenerator;
use crate::history::SessionHistory;
use crate::keywords::{KeywordExtractor, MinimalityReport, MinimalityValidator};
use crate::model::{
    AnswerType, BranchType, CircularRisk, Document, ExtensionContext, ExtensionStrategy,
    ExtensionType, GenerationMethod, Keyword, QuestionNode, ReasoningTree, ShortAnswer,
    TreeStatus, ValidationResult,
};
use crate::providers::{CircuitBreaker, SharedBreaker};
use crate::search::{SearchClient, SearchProvider};
use crate::state::{NodeLifecycle, NodeState};
use crate::trajectory::{StepDraft, StepType, Trajectory, TrajectoryRecorder};
use crate::validator::DualValidator;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Output for one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentResult {
    pub document_id: String,
    /// `None` when no root question could be validated.
    pub tree: Option<ReasoningTree>,
    pub trajectory: Trajectory,
}

impl DocumentResult {
    pub fn is_cancelled(&self) -> bool {
        self.trajectory.cancelled
    }

    /// One-line summary for logs and the CLI.
    pub fn summary(&self) -> String {
        match &self.tree {
            Some(tree) => format!(
                "{}: {} nodes, depth {}, {} composites, {} search calls{}",
                self.document_id,
                tree.len(),
                tree.depth(),
                tree.composites.len(),
                self.trajectory.stats.total_search_calls,
                if self.is_cancelled() { " (cancelled)" } else { "" }
            ),
            None => format!("{}: no valid root question", self.document_id),
        }
    }
}

/// What acceptance needs to know about a validated candidate.
struct Candidate<'a> {
    lifecycle: &'a mut NodeLifecycle,
    parent: Option<&'a QuestionNode>,
    question: String,
    answer: String,
    answer_type: AnswerType,
    branch_type: BranchType,
    validation: ValidationResult,
    extension: Option<ExtensionContext>,
    ancestor_answers: Vec<String>,
    prior_compliance: f64,
}

pub struct TreeOrchestrator {
    config: DeepTreeConfig,
    generator: QuestionGenerator,
    validator: DualValidator,
    extractor: KeywordExtractor,
    minimality: MinimalityValidator,
    detector: CircularDetector,
    extension: ExtensionEngine,
    compliance: ComplianceEnforcer,
    integrator: CompositeIntegrator,
    cancel: CancellationToken,
    last_keywords: Option<MinimalKeywords>,
}

/// Keyword extraction and masking outcome for one question text.
#[derive(Debug, Clone)]
struct MinimalKeywords {
    question: String,
    answer: String,
    fallback_used: bool,
    report: MinimalityReport,
}

impl TreeOrchestrator {
    pub fn new(
        config: DeepTreeConfig,
        brain: Arc<Brain>,
        validator_brain: Option<Arc<Brain>>,
        search: SearchClient,
    ) -> Self {
        let integrator = CompositeIntegrator::new(
            Some(brain.clone()),
            config.integration.llm_integrated,
            config.integration.ambiguous,
        );
        Self {
            generator: QuestionGenerator::new(brain.clone(), config.root.max_document_chars),
            validator: DualValidator::new(brain.clone(), validator_brain, &config.root),
            extractor: KeywordExtractor::new(brain.clone(), config.minimality.max_keywords),
            minimality: MinimalityValidator::new(brain.clone(), &config.minimality),
            detector: CircularDetector::new(config.circular.clone()),
            extension: ExtensionEngine::new(brain, search, &config.extension),
            compliance: ComplianceEnforcer::new(&config.compliance),
            integrator,
            cancel: CancellationToken::new(),
            last_keywords: None,
            config,
        }
    }

    /// Wire brains and the search client around one shared circuit breaker.
    pub fn from_providers(
        config: DeepTreeConfig,
        llm: Arc<dyn LlmProvider>,
        validator_llm: Option<Arc<dyn LlmProvider>>,
        search: Arc<dyn SearchProvider>,
    ) -> Self {
        let breaker = shared_breaker(&config);
        let brain = Arc::new(Brain::new(llm, &config.llm, &config.resilience, breaker.clone()));
        let validator_brain = validator_llm.map(|provider| {
            let llm_config = config.validator_llm.as_ref().unwrap_or(&config.llm);
            Arc::new(Brain::new(
                provider,
                llm_config,
                &config.resilience,
                breaker.clone(),
            ))
        });
        let client = SearchClient::new(
            search,
            &config.search,
            &config.resilience,
            config.extension.cache_capacity,
            breaker,
        );
        Self::new(config, brain, validator_brain, client)
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &DeepTreeConfig {
        &self.config
    }

    /// Build, integrate and record the reasoning tree of `document`.
    pub async fn process_document(
        &mut self,
        document: &Document,
        history: &mut SessionHistory,
    ) -> DocumentResult {
        let started = Instant::now();
        let mut recorder = TrajectoryRecorder::new(&document.id);
        let mut tree = ReasoningTree::new(&document.id, self.config.tree.max_layers);
        self.last_keywords = None;
        info!(document_id = %document.id, answers = document.short_answers.len(), "Building tree");

        let root_id = self
            .build_root(document, &mut tree, history, &mut recorder)
            .await;
        let Some(root_id) = root_id else {
            let cancelled = self.cancel.is_cancelled();
            warn!(document_id = %document.id, cancelled, "No root question accepted");
            return DocumentResult {
                document_id: document.id.clone(),
                tree: None,
                trajectory: recorder.finalize(None, cancelled),
            };
        };

        self.extend_tree(document, root_id, &mut tree, history, &mut recorder)
            .await;

        let cancelled = self.cancel.is_cancelled();
        tree.status = if cancelled {
            TreeStatus::Cancelled
        } else {
            TreeStatus::Complete
        };

        let integration_started = Instant::now();
        let composites = self.integrator.integrate(&tree).await;
        let round_trip = composites.iter().all(|c| c.verify_round_trip());
        recorder.record(
            StepDraft::new(StepType::Integration, !composites.is_empty() && round_trip)
                .inputs(json!({ "nodes": tree.len(), "depth": tree.depth() }))
                .outputs(json!({
                    "composites": composites
                        .iter()
                        .map(|c| json!({ "kind": c.kind, "tier": c.tier, "hops": c.hops() }))
                        .collect::<Vec<_>>(),
                    "round_trip": round_trip,
                }))
                .duration(integration_started.elapsed()),
        );
        tree.composites = composites;

        let trajectory = recorder.finalize(Some(&tree), cancelled);
        info!(
            document_id = %document.id,
            nodes = tree.len(),
            depth = tree.depth(),
            search_calls = trajectory.stats.total_search_calls,
            elapsed_ms = started.elapsed().as_millis() as u64,
            cancelled,
            "Tree finalized"
        );
        DocumentResult {
            document_id: document.id.clone(),
            tree: Some(tree),
            trajectory,
        }
    }

    async fn build_root(
        &mut self,
        document: &Document,
        tree: &mut ReasoningTree,
        history: &mut SessionHistory,
        recorder: &mut TrajectoryRecorder,
    ) -> Option<Uuid> {
        let mut answers: Vec<&ShortAnswer> = document
            .short_answers
            .iter()
            .filter(|a| a.confidence >= self.config.root.min_answer_confidence)
            .collect();
        answers.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        for answer in answers {
            if self.cancel.is_cancelled() {
                return None;
            }
            let mut lifecycle = NodeLifecycle::root();
            match self
                .attempt_root(document, answer, &mut lifecycle, tree, history, recorder)
                .await
            {
                Ok(Some(id)) => return Some(id),
                Ok(None) => {
                    info!(answer = %answer.text, "Root answer abandoned, trying next");
                    reject(&mut lifecycle, "root attempts exhausted");
                }
                Err(e) => {
                    error!(answer = %answer.text, error = %e, "Root lifecycle error");
                    reject(&mut lifecycle, e.to_string());
                }
            }
        }
        None
    }

    async fn attempt_root(
        &mut self,
        document: &Document,
        answer: &ShortAnswer,
        lifecycle: &mut NodeLifecycle,
        tree: &mut ReasoningTree,
        history: &mut SessionHistory,
        recorder: &mut TrajectoryRecorder,
    ) -> Result<Option<Uuid>, TreeError> {
        let id = lifecycle.candidate_id;
        for attempt in 0..self.config.root.max_attempts.max(1) {
            let started = Instant::now();
            let inputs = json!({
                "answer": answer.text,
                "answer_type": answer.answer_type,
                "attempt": attempt + 1,
            });
            let generated = match self.generator.generate_root(document, answer, attempt).await {
                Ok(g) => g,
                Err(failure) => {
                    debug!(answer = %answer.text, attempt, %failure, "Root generation rejected");
                    record_generation_failure(recorder, id, 0, inputs, &failure.to_string(), started);
                    continue;
                }
            };
            lifecycle.transition(NodeState::QuestionGenerated)?;

            let subject = ComplianceSubject {
                question: &generated.question,
                answer: &answer.text,
                evidence: Some(document.text.as_str()),
                ..ComplianceSubject::default()
            };
            let generation_report = self.check(CompliancePhase::Generation, &subject, id, 0, recorder);
            if !generation_report.is_acceptable() {
                record_generation_failure(recorder, id, 0, inputs, "generation compliance", started);
                if generation_report.is_terminal() {
                    return Ok(None);
                }
                continue;
            }

            let validation = self
                .validator
                .validate(&generated.question, &answer.text, &document.text)
                .await;
            lifecycle.transition(NodeState::DualValidated)?;
            let subject = ComplianceSubject {
                question: &generated.question,
                answer: &answer.text,
                validation: Some(&validation),
                validators_independent: self.validator.is_independent(),
                ..ComplianceSubject::default()
            };
            let validation_report = self.check(CompliancePhase::Validation, &subject, id, 0, recorder);
            if !validation.passed || !validation_report.is_acceptable() {
                record_validation_failure(recorder, id, 0, &generated.question, &validation, started);
                if validation_report.status == ComplianceStatus::NonCompliant
                    && !validation_report.should_retry()
                {
                    return Ok(None);
                }
                lifecycle.transition(NodeState::QuestionGenerated)?;
                continue;
            }

            let candidate = Candidate {
                lifecycle: &mut *lifecycle,
                parent: None,
                question: generated.question.clone(),
                answer: answer.text.clone(),
                answer_type: answer.answer_type,
                branch_type: BranchType::Root,
                validation,
                extension: None,
                ancestor_answers: Vec::new(),
                prior_compliance: generation_report.overall.min(validation_report.overall),
            };
            match self.accept(candidate, tree, history, recorder, started).await? {
                Some(id) => return Ok(Some(id)),
                None => {
                    lifecycle.transition(NodeState::QuestionGenerated)?;
                    continue;
                }
            }
        }
        Ok(None)
    }

    async fn extend_tree(
        &mut self,
        document: &Document,
        root_id: Uuid,
        tree: &mut ReasoningTree,
        history: &mut SessionHistory,
        recorder: &mut TrajectoryRecorder,
    ) {
        let mut stack = vec![root_id];
        while let Some(node_id) = stack.pop() {
            if self.cancel.is_cancelled() {
                info!("Cancellation requested, stopping extension");
                break;
            }
            let Some(parent) = tree.get(node_id).cloned() else {
                continue;
            };
            if parent.layer_level >= self.config.tree.max_layers {
                continue;
            }

            let mut accepted = Vec::new();
            for keyword in &parent.keywords {
                if accepted.len() >= self.config.tree.max_children_per_node
                    || tree.len() >= self.config.tree.max_nodes
                    || self.cancel.is_cancelled()
                {
                    break;
                }
                if let Some(sibling) = tree.overlapping_sibling(parent.id, &keyword.text) {
                    debug!(
                        keyword = %keyword.text,
                        sibling = ?sibling.parent_keyword,
                        "Keyword overlaps an extended sibling, not extended"
                    );
                    continue;
                }
                let extension_type = if accepted.is_empty() {
                    ExtensionType::Series
                } else {
                    ExtensionType::Parallel
                };
                let mut lifecycle = NodeLifecycle::child();
                match self
                    .extend_keyword(
                        document,
                        &parent,
                        keyword,
                        extension_type,
                        &mut lifecycle,
                        tree,
                        history,
                        recorder,
                    )
                    .await
                {
                    Ok(Some(child_id)) => accepted.push(child_id),
                    Ok(None) => {}
                    Err(e) => {
                        error!(keyword = %keyword.text, error = %e, "Child lifecycle error");
                        reject(&mut lifecycle, e.to_string());
                    }
                }
            }
            // first child on top: depth first, in keyword order
            stack.extend(accepted.into_iter().rev());
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn extend_keyword(
        &mut self,
        document: &Document,
        parent: &QuestionNode,
        keyword: &Keyword,
        extension_type: ExtensionType,
        lifecycle: &mut NodeLifecycle,
        tree: &mut ReasoningTree,
        history: &mut SessionHistory,
        recorder: &mut TrajectoryRecorder,
    ) -> Result<Option<Uuid>, TreeError> {
        let id = lifecycle.candidate_id;
        let layer = parent.layer_level + 1;
        // the keyword came from the parent's extracted, mask-validated set
        lifecycle.transition(NodeState::KeywordExtracted)?;
        lifecycle.transition(NodeState::MaskValidated)?;

        let pre = CandidatePair::expected_answer(&keyword.text, parent.id, tree.tree_id);
        let risk = self.detector.assess(&pre, history);
        record_circular(recorder, id, layer, &keyword.text, None, &risk);
        if risk.should_skip {
            info!(keyword = %keyword.text, score = risk.similarity_score, "Branch skipped as circular");
            reject(lifecycle, risk.reason);
            return Ok(None);
        }
        lifecycle.transition(NodeState::CircularChecked)?;

        let strategy = ExtensionStrategy::from(risk.recommended_action);
        let request = ExtensionRequest {
            candidate_id: id,
            layer,
            keyword: &keyword.text,
            parent_question: &parent.question_text,
            parent_answer: &parent.answer,
            extension_type,
            strategy,
            document_text: &document.text,
        };
        let Some(context) = self.extension.extend(&request, recorder).await else {
            reject(lifecycle, "extension abandoned");
            return Ok(None);
        };
        lifecycle.transition(NodeState::SearchSynthesized)?;

        let budget = (context.search_calls, self.extension_budget());
        let extension_report = self.check(
            CompliancePhase::Extension,
            &ComplianceSubject {
                question: &parent.question_text,
                answer: &keyword.text,
                search_budget: Some(budget),
                ..ComplianceSubject::default()
            },
            id,
            layer,
            recorder,
        );
        if !extension_report.is_acceptable() {
            reject(lifecycle, "search budget exceeded");
            return Ok(None);
        }

        let ancestor_answers = tree.lineage_answers(parent.id);
        let answer_type = keyword.keyword_type.answer_type();
        let mut evidence = context.synthesized_context.clone();
        for fact in &context.facts {
            evidence.push_str("\n- ");
            evidence.push_str(fact);
        }

        for attempt in 0..self.config.child.max_generation_attempts.max(1) {
            let started = Instant::now();
            let inputs = json!({
                "keyword": keyword.text,
                "extension_type": extension_type,
                "attempt": attempt + 1,
            });
            let generated = match self
                .generator
                .generate_child(&keyword.text, answer_type, &context, &ancestor_answers, attempt)
                .await
            {
                Ok(g) => g,
                Err(failure) => {
                    debug!(keyword = %keyword.text, attempt, %failure, "Child generation rejected");
                    record_generation_failure(recorder, id, layer, inputs, &failure.to_string(), started);
                    continue;
                }
            };
            lifecycle.transition(NodeState::QuestionGenerated)?;

            let post = CandidatePair::generated(
                &generated.question,
                &keyword.text,
                parent.id,
                tree.tree_id,
            );
            let risk = self.detector.assess(&post, history);
            record_circular(recorder, id, layer, &keyword.text, Some(generated.question.as_str()), &risk);
            if risk.should_skip {
                record_generation_failure(recorder, id, layer, inputs, "circular question", started);
                continue;
            }

            let subject = ComplianceSubject {
                question: &generated.question,
                answer: &keyword.text,
                parent_keyword: Some(keyword.text.as_str()),
                parent_keywords: Some(parent.keywords.as_slice()),
                ancestor_answers: &ancestor_answers,
                evidence: Some(evidence.as_str()),
                search_budget: Some(budget),
                ..ComplianceSubject::default()
            };
            let generation_report =
                self.check(CompliancePhase::Generation, &subject, id, layer, recorder);
            if !generation_report.is_acceptable() {
                record_generation_failure(recorder, id, layer, inputs, "generation compliance", started);
                if generation_report.is_terminal() {
                    break;
                }
                continue;
            }

            let validation = self
                .validator
                .validate(&generated.question, &keyword.text, &evidence)
                .await;
            lifecycle.transition(NodeState::DualValidated)?;
            let subject = ComplianceSubject {
                question: &generated.question,
                answer: &keyword.text,
                validation: Some(&validation),
                validators_independent: self.validator.is_independent(),
                ..ComplianceSubject::default()
            };
            let validation_report =
                self.check(CompliancePhase::Validation, &subject, id, layer, recorder);
            if !validation.passed || !validation_report.is_acceptable() {
                record_validation_failure(recorder, id, layer, &generated.question, &validation, started);
                lifecycle.transition(NodeState::QuestionGenerated)?;
                continue;
            }

            let candidate = Candidate {
                lifecycle: &mut *lifecycle,
                parent: Some(parent),
                question: generated.question.clone(),
                answer: keyword.text.clone(),
                answer_type,
                branch_type: extension_type.into(),
                validation,
                extension: Some(context.clone()),
                ancestor_answers: ancestor_answers.clone(),
                prior_compliance: generation_report.overall.min(validation_report.overall),
            };
            match self.accept(candidate, tree, history, recorder, started).await? {
                Some(child_id) => return Ok(Some(child_id)),
                None => {
                    lifecycle.transition(NodeState::QuestionGenerated)?;
                    continue;
                }
            }
        }

        reject(lifecycle, "child attempts exhausted");
        Ok(None)
    }

    /// Extract and minimise keywords, run extraction compliance and insert the
    /// node. `Ok(None)` means this attempt was rejected.
    async fn accept(
        &mut self,
        candidate: Candidate<'_>,
        tree: &mut ReasoningTree,
        history: &mut SessionHistory,
        recorder: &mut TrajectoryRecorder,
        started: Instant,
    ) -> Result<Option<Uuid>, TreeError> {
        let id = candidate.lifecycle.candidate_id;
        let layer = candidate.parent.map(|p| p.layer_level + 1).unwrap_or(0);

        let (fallback_used, report) = self
            .minimal_keywords(&candidate.question, &candidate.answer, id, layer, recorder)
            .await;

        let subject = ComplianceSubject {
            question: &candidate.question,
            answer: &candidate.answer,
            parent_keyword: candidate.parent.map(|_| candidate.answer.as_str()),
            parent_keywords: candidate.parent.map(|p| p.keywords.as_slice()),
            ancestor_answers: &candidate.ancestor_answers,
            keywords: Some(report.kept.as_slice()),
            minimality: Some(&report),
            ..ComplianceSubject::default()
        };
        let extraction_report = self.check(CompliancePhase::Extraction, &subject, id, layer, recorder);
        if !extraction_report.is_acceptable() {
            record_validation_failure(
                recorder,
                id,
                layer,
                &candidate.question,
                &candidate.validation,
                started,
            );
            return Ok(None);
        }

        // recheck with the real minimal keywords; the post-generation check
        // only had the question's entities to go on
        if let Some(parent) = candidate.parent {
            let pair = CandidatePair::generated(
                &candidate.question,
                &candidate.answer,
                parent.id,
                tree.tree_id,
            )
            .with_keywords(report.kept_texts());
            let risk = self.detector.assess(&pair, history);
            if risk.should_skip {
                record_circular(
                    recorder,
                    id,
                    layer,
                    &candidate.answer,
                    Some(candidate.question.as_str()),
                    &risk,
                );
                record_validation_failure(
                    recorder,
                    id,
                    layer,
                    &candidate.question,
                    &candidate.validation,
                    started,
                );
                return Ok(None);
            }
        }

        let node = QuestionNode {
            id,
            parent_id: candidate.parent.map(|p| p.id),
            parent_keyword: candidate.parent.map(|_| candidate.answer.clone()),
            question_text: candidate.question.clone(),
            answer: candidate.answer.clone(),
            answer_type: candidate.answer_type,
            layer_level: layer,
            branch_type: candidate.branch_type,
            keywords: report.kept.clone(),
            validation_passed: candidate.validation.passed,
            validation: candidate.validation.clone(),
            generation_method: if candidate.parent.is_some() {
                GenerationMethod::SearchExtension
            } else {
                GenerationMethod::DocumentGrounded
            },
            extension: candidate.extension,
            compliance_score: candidate.prior_compliance.min(extraction_report.overall),
            created_at: Utc::now(),
        };

        if let Err(e) = tree.accept(node.clone()) {
            warn!(node_id = %id, error = %e, "Tree rejected node");
            record_validation_failure(
                recorder,
                id,
                layer,
                &candidate.question,
                &candidate.validation,
                started,
            );
            return Ok(None);
        }
        candidate.lifecycle.transition(NodeState::Accepted)?;
        history.record_node(tree.tree_id, &node);

        recorder.record(
            StepDraft::new(StepType::Extraction, true)
                .node(id, layer)
                .inputs(json!({
                    "question": node.question_text,
                    "answer": node.answer,
                    "parent_keyword": node.parent_keyword,
                }))
                .outputs(json!({
                    "keywords": node.keyword_texts(),
                    "dropped": report.dropped.iter().map(|k| &k.text).collect::<Vec<_>>(),
                    "sufficiency_verified": report.sufficiency_verified,
                    "keyword_fallback": fallback_used,
                    "validity": node.validation.validity_score,
                    "uniqueness": node.validation.uniqueness_score,
                    "compliance": node.compliance_score,
                }))
                .validation_score(node.validation.mean_score())
                .duration(started.elapsed()),
        );
        info!(
            node_id = %id,
            layer,
            answer = %node.answer,
            keywords = node.keywords.len(),
            "Node accepted"
        );
        Ok(Some(id))
    }

    /// Extract and minimise the keywords of `question`. A retry that comes
    /// back with the same question text reuses the previous outcome.
    async fn minimal_keywords(
        &mut self,
        question: &str,
        answer: &str,
        node_id: Uuid,
        layer: usize,
        recorder: &mut TrajectoryRecorder,
    ) -> (bool, MinimalityReport) {
        let cached = self
            .last_keywords
            .as_ref()
            .filter(|k| k.question == question && k.answer == answer)
            .map(|k| (k.fallback_used, k.report.clone()));
        if let Some(hit) = cached {
            debug!(question, "Question unchanged, reusing keyword extraction");
            return hit;
        }

        let extraction = self.extractor.extract(question, answer).await;
        let report = self
            .minimality
            .validate(question, answer, extraction.keywords)
            .await;
        record_masking(recorder, node_id, layer, &report);
        self.last_keywords = Some(MinimalKeywords {
            question: question.to_string(),
            answer: answer.to_string(),
            fallback_used: extraction.fallback_used,
            report: report.clone(),
        });
        (extraction.fallback_used, report)
    }

    fn check(
        &self,
        phase: CompliancePhase,
        subject: &ComplianceSubject<'_>,
        node_id: Uuid,
        layer: usize,
        recorder: &mut TrajectoryRecorder,
    ) -> ComplianceReport {
        let report = self.compliance.evaluate(phase, subject);
        recorder.record(
            StepDraft::new(StepType::Compliance, report.is_acceptable())
                .node(node_id, layer)
                .inputs(json!({ "phase": phase }))
                .outputs(json!({
                    "overall": report.overall,
                    "status": report.status,
                    "remediations": report.remediations,
                })),
        );
        report
    }

    fn extension_budget(&self) -> usize {
        self.config
            .extension
            .max_attempts
            .clamp(1, MAX_EXTENSION_ATTEMPTS)
    }
}

/// Breaker shared by every upstream client of one orchestrator.
pub fn shared_breaker(config: &DeepTreeConfig) -> SharedBreaker {
    CircuitBreaker::shared(
        config.resilience.breaker_window,
        config.resilience.breaker_failure_threshold,
        Duration::from_secs(config.resilience.breaker_cooldown_secs),
    )
}

fn reject(lifecycle: &mut NodeLifecycle, reason: impl Into<String>) {
    if lifecycle.state().is_terminal() {
        return;
    }
    if let Err(e) = lifecycle.reject(reason) {
        error!(error = %e, "Could not reject candidate");
    }
}

fn record_generation_failure(
    recorder: &mut TrajectoryRecorder,
    node_id: Uuid,
    layer: usize,
    inputs: serde_json::Value,
    reason: &str,
    started: Instant,
) {
    recorder.record(
        StepDraft::new(StepType::Generation, false)
            .node(node_id, layer)
            .inputs(inputs)
            .outputs(json!({ "reason": reason }))
            .duration(started.elapsed()),
    );
}

fn record_validation_failure(
    recorder: &mut TrajectoryRecorder,
    node_id: Uuid,
    layer: usize,
    question: &str,
    validation: &ValidationResult,
    started: Instant,
) {
    recorder.record(
        StepDraft::new(StepType::Validation, false)
            .node(node_id, layer)
            .inputs(json!({ "question": question }))
            .outputs(json!({
                "passed": validation.passed,
                "validity": validation.validity_score,
                "uniqueness": validation.uniqueness_score,
                "issues": validation.issues,
            }))
            .validation_score(validation.mean_score())
            .duration(started.elapsed()),
    );
}

fn record_circular(
    recorder: &mut TrajectoryRecorder,
    node_id: Uuid,
    layer: usize,
    keyword: &str,
    question: Option<&str>,
    risk: &CircularRisk,
) {
    recorder.record(
        StepDraft::new(StepType::CircularCheck, !risk.should_skip)
            .node(node_id, layer)
            .inputs(json!({ "keyword": keyword, "question": question }))
            .outputs(json!({
                "score": risk.similarity_score,
                "risk_level": risk.risk_level,
                "action": risk.recommended_action,
                "signal": risk.signal,
                "reason": risk.reason,
            })),
    );
}

fn record_masking(
    recorder: &mut TrajectoryRecorder,
    node_id: Uuid,
    layer: usize,
    report: &MinimalityReport,
) {
    for test in &report.tests {
        recorder.record(
            StepDraft::new(StepType::Masking, true)
                .node(node_id, layer)
                .inputs(json!({
                    "keyword": test.keyword,
                    "masked_question": test.masked_question,
                }))
                .outputs(json!({
                    "necessity_score": test.necessity_score,
                    "necessary": test.necessary,
                    "fallback_used": test.fallback_used,
                })),
        );
    }
}
