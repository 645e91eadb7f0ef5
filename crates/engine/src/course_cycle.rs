//! Course rotation: nurture, pitch, purchase check, advance, loop.
//!
//! The controller owns cycle configs and stored cycle email content, and
//! makes every course-cycle decision as a pure function of the config, the
//! execution's [`CourseCycleState`] and the tick's `now`. The step executor
//! performs the resulting sends, tag writes and edge moves.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use nurture_core::collaborators::ContentGenerator;
use nurture_core::types::{ContentRequest, EmailEvent, GeneratedContent};
use nurture_core::{EngineError, EngineResult};

pub const DEFAULT_PURCHASE_TAG_PREFIX: &str = "purchased_course_";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingMode {
    #[default]
    Fixed,
    Engagement,
}

/// Per-course pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseTiming {
    pub course_id: String,
    #[serde(default)]
    pub timing_mode: TimingMode,
    pub nurture_email_count: u32,
    pub nurture_delay_days: u32,
    pub pitch_email_count: u32,
    pub pitch_delay_days: u32,
    pub purchase_check_delay_days: u32,
    #[serde(default)]
    pub engagement_wait_days: Option<u32>,
    #[serde(default)]
    pub min_engagement_actions: Option<u32>,
}

/// What a purchase check does when the course was not bought.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum NotPurchasedPolicy {
    #[default]
    Advance,
    Repitch {
        #[serde(rename = "maxRepitches")]
        max_repitches: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseCycleConfig {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Playlist order.
    pub course_ids: Vec<String>,
    pub course_timings: Vec<CourseTiming>,
    #[serde(default)]
    pub loop_on_completion: bool,
    #[serde(default)]
    pub different_content_on_second_cycle: bool,
    #[serde(default)]
    pub not_purchased_policy: NotPurchasedPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CourseCycleConfig {
    pub fn new(name: impl Into<String>, course_timings: Vec<CourseTiming>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            course_ids: course_timings.iter().map(|t| t.course_id.clone()).collect(),
            course_timings,
            loop_on_completion: false,
            different_content_on_second_cycle: false,
            not_purchased_policy: NotPurchasedPolicy::Advance,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn timing(&self, course_id: &str) -> Option<&CourseTiming> {
        self.course_timings.iter().find(|t| t.course_id == course_id)
    }

    pub fn course_at(&self, index: usize) -> Option<&str> {
        self.course_ids.get(index).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Nurture,
    Pitch,
}

impl CyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CyclePhase::Nurture => "nurture",
            CyclePhase::Pitch => "pitch",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentSet {
    #[default]
    Primary,
    Alternate,
}

/// Course-cycle position carried in execution variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseCycleState {
    pub config_id: Uuid,
    pub current_course_index: usize,
    pub cycle_count: u32,
    pub phase: CyclePhase,
    pub email_index: u32,
    #[serde(default)]
    pub purchased_course_ids: BTreeSet<String>,
    #[serde(default)]
    pub repitch_count: u32,
    #[serde(default)]
    pub content_set: ContentSet,
}

impl CourseCycleState {
    fn enter_course(&mut self, index: usize) {
        self.current_course_index = index;
        self.phase = CyclePhase::Nurture;
        self.email_index = 0;
        self.repitch_count = 0;
    }
}

/// An engagement-timed wait in progress on a course email node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementWait {
    pub node_id: String,
    pub deadline: DateTime<Utc>,
    /// Engagement actions already counted when the wait began.
    pub baseline_actions: u32,
    pub min_actions: u32,
    /// Leave the node once the wait resolves instead of sending again.
    pub exit_after: bool,
}

impl EngagementWait {
    pub fn is_resolved(&self, actions: u32, now: DateTime<Utc>) -> bool {
        now >= self.deadline || actions.saturating_sub(self.baseline_actions) >= self.min_actions
    }
}

/// Stored content for one email slot of a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleEmail {
    pub id: Uuid,
    pub config_id: Uuid,
    pub course_id: String,
    pub phase: CyclePhase,
    pub email_index: u32,
    pub content_set: ContentSet,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub generated: bool,
    #[serde(default)]
    pub sent_count: u64,
    #[serde(default)]
    pub opened_count: u64,
    #[serde(default)]
    pub clicked_count: u64,
}

impl CycleEmail {
    pub fn new(
        config_id: Uuid,
        course_id: impl Into<String>,
        phase: CyclePhase,
        email_index: u32,
        content_set: ContentSet,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            config_id,
            course_id: course_id.into(),
            phase,
            email_index,
            content_set,
            subject: subject.into(),
            body: body.into(),
            generated: false,
            sent_count: 0,
            opened_count: 0,
            clicked_count: 0,
        }
    }

    fn slot(&self) -> EmailSlot {
        EmailSlot {
            config_id: self.config_id,
            course_id: self.course_id.clone(),
            phase: self.phase,
            email_index: self.email_index,
            content_set: self.content_set,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EmailSlot {
    config_id: Uuid,
    course_id: String,
    phase: CyclePhase,
    email_index: u32,
    content_set: ContentSet,
}

/// Outcome of entering a `courseCycle` node.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleStart {
    Started(CourseCycleState),
    AllPurchased,
}

/// Outcome of a `cycleLoop` node.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopDecision {
    /// Moved to the next course in this pass.
    Next(CourseCycleState),
    /// Wrapped to the start of the playlist.
    Looped(CourseCycleState),
    /// End of the playlist with looping disabled.
    Finished,
    AllPurchased,
}

/// Outcome of a `purchaseCheck` node that found no purchase.
#[derive(Debug, Clone, PartialEq)]
pub enum NotPurchased {
    Repitch(CourseCycleState),
    Advance,
}

/// What a `courseEmail` node does after its send.
#[derive(Debug, Clone, PartialEq)]
pub enum EmailFollowUp {
    /// Stay on the node; next send at `at`.
    SendNextAt {
        state: CourseCycleState,
        at: DateTime<Utc>,
    },
    /// Stay on the node racing an engagement condition.
    AwaitEngagement {
        state: CourseCycleState,
        wait: EngagementWait,
    },
    /// Follow the outgoing edge, due at `at`.
    Leave {
        state: CourseCycleState,
        at: DateTime<Utc>,
    },
}

/// Owns course-cycle configs and their stored email content.
pub struct CourseCycleController {
    configs: DashMap<Uuid, Arc<CourseCycleConfig>>,
    emails: DashMap<EmailSlot, CycleEmail>,
    email_slots: DashMap<Uuid, EmailSlot>,
    generator: Option<Arc<dyn ContentGenerator>>,
    generator_timeout: StdDuration,
}

impl CourseCycleController {
    pub fn new(generator: Option<Arc<dyn ContentGenerator>>, generator_timeout: StdDuration) -> Self {
        Self {
            configs: DashMap::new(),
            emails: DashMap::new(),
            email_slots: DashMap::new(),
            generator,
            generator_timeout,
        }
    }

    // ─── Config CRUD ────────────────────────────────────────────────────

    pub fn save_config(&self, mut config: CourseCycleConfig) -> EngineResult<CourseCycleConfig> {
        validate_config(&config)?;
        config.updated_at = Utc::now();
        info!(config_id = %config.id, courses = config.course_ids.len(), "Saved course cycle config");
        self.configs.insert(config.id, Arc::new(config.clone()));
        Ok(config)
    }

    pub fn config(&self, id: Uuid) -> Option<Arc<CourseCycleConfig>> {
        self.configs.get(&id).map(|c| Arc::clone(c.value()))
    }

    pub fn list_configs(&self) -> Vec<CourseCycleConfig> {
        let mut all: Vec<_> = self.configs.iter().map(|c| (**c.value()).clone()).collect();
        all.sort_by_key(|c| c.created_at);
        all
    }

    /// Deletes a config together with its stored emails.
    pub fn delete_config(&self, id: Uuid) -> bool {
        self.emails.retain(|slot, _| slot.config_id != id);
        self.email_slots.retain(|_, slot| slot.config_id != id);
        self.configs.remove(&id).is_some()
    }

    // ─── Stored content ─────────────────────────────────────────────────

    /// Stores content for a slot, replacing what was there but keeping its counters.
    pub fn save_cycle_email(&self, mut email: CycleEmail) -> EngineResult<CycleEmail> {
        let config = self
            .config(email.config_id)
            .ok_or_else(|| EngineError::not_found("CourseCycleConfig", email.config_id))?;
        if config.timing(&email.course_id).is_none() {
            return Err(EngineError::Config(format!(
                "Course {} is not part of cycle {}",
                email.course_id, config.name
            )));
        }
        if email.subject.trim().is_empty() || email.body.trim().is_empty() {
            return Err(EngineError::Config(
                "Cycle email needs a subject and a body".into(),
            ));
        }

        let slot = email.slot();
        if let Some(existing) = self.emails.get(&slot) {
            email.id = existing.id;
            email.sent_count = existing.sent_count;
            email.opened_count = existing.opened_count;
            email.clicked_count = existing.clicked_count;
        }
        self.email_slots.insert(email.id, slot.clone());
        self.emails.insert(slot, email.clone());
        Ok(email)
    }

    pub fn cycle_emails(&self, config_id: Uuid) -> Vec<CycleEmail> {
        let mut emails: Vec<CycleEmail> = self
            .emails
            .iter()
            .filter(|e| e.config_id == config_id)
            .map(|e| e.clone())
            .collect();
        emails.sort_by(|a, b| {
            (&a.course_id, a.content_set as u8, a.phase as u8, a.email_index)
                .cmp(&(&b.course_id, b.content_set as u8, b.phase as u8, b.email_index))
        });
        emails
    }

    pub fn cycle_email(&self, email_id: Uuid) -> Option<CycleEmail> {
        let slot = self.email_slots.get(&email_id)?.clone();
        self.emails.get(&slot).map(|e| e.clone())
    }

    pub fn record_sent(&self, email_id: Uuid) {
        self.bump(email_id, |e| e.sent_count += 1);
    }

    pub fn record_email_event(&self, email_id: Uuid, event: &EmailEvent) {
        match event {
            EmailEvent::Delivered => {}
            EmailEvent::Opened => self.bump(email_id, |e| e.opened_count += 1),
            EmailEvent::Clicked { .. } => self.bump(email_id, |e| e.clicked_count += 1),
        }
    }

    fn bump(&self, email_id: Uuid, f: impl FnOnce(&mut CycleEmail)) {
        let Some(slot) = self.email_slots.get(&email_id).map(|s| s.clone()) else {
            return;
        };
        if let Some(mut email) = self.emails.get_mut(&slot) {
            f(email.value_mut());
        }
    }

    /// Content for the state's current slot: stored content first, then the
    /// generator. `None` means the send should be skipped.
    pub async fn content_for(&self, state: &CourseCycleState) -> Option<CycleEmail> {
        let config = self.config(state.config_id)?;
        let course_id = config.course_at(state.current_course_index)?.to_string();
        let slot = EmailSlot {
            config_id: state.config_id,
            course_id: course_id.clone(),
            phase: state.phase,
            email_index: state.email_index,
            content_set: state.content_set,
        };
        if let Some(stored) = self.emails.get(&slot) {
            return Some(stored.clone());
        }

        let generator = self.generator.as_ref()?;
        let request = ContentRequest {
            course_id: course_id.clone(),
            phase: state.phase.as_str().to_string(),
            email_index: state.email_index,
            alternate: state.content_set == ContentSet::Alternate,
        };
        let generated = match tokio::time::timeout(self.generator_timeout, generator.generate(&request)).await {
            Ok(Ok(content)) => content,
            Ok(Err(err)) => {
                warn!(course_id = %course_id, error = %err, "Content generation failed");
                return None;
            }
            Err(_) => {
                warn!(
                    course_id = %course_id,
                    timeout_ms = self.generator_timeout.as_millis() as u64,
                    "Content generation timed out"
                );
                return None;
            }
        };
        if generated.is_empty() {
            debug!(course_id = %course_id, "Generator returned empty content");
            return None;
        }

        let GeneratedContent { subject, body } = generated;
        let mut email = CycleEmail::new(
            state.config_id,
            course_id,
            state.phase,
            state.email_index,
            state.content_set,
            subject,
            body,
        );
        email.generated = true;
        // Cache so later contacts reuse the same content for this slot.
        let email = self
            .emails
            .entry(slot.clone())
            .or_insert_with(|| email)
            .clone();
        self.email_slots.insert(email.id, slot);
        Some(email)
    }

    // ─── Decisions ──────────────────────────────────────────────────────

    /// Positions a contact on the first course they have not bought.
    pub fn start(
        &self,
        config: &CourseCycleConfig,
        previous: Option<&CourseCycleState>,
        purchased: &BTreeSet<String>,
    ) -> CycleStart {
        let mut state = match previous.filter(|p| p.config_id == config.id) {
            Some(p) => p.clone(),
            None => CourseCycleState {
                config_id: config.id,
                current_course_index: 0,
                cycle_count: 0,
                phase: CyclePhase::Nurture,
                email_index: 0,
                purchased_course_ids: BTreeSet::new(),
                repitch_count: 0,
                content_set: ContentSet::Primary,
            },
        };
        state.purchased_course_ids.extend(
            config
                .course_ids
                .iter()
                .filter(|c| purchased.contains(*c))
                .cloned(),
        );

        let len = config.course_ids.len();
        let from = state.current_course_index.min(len.saturating_sub(1));
        for offset in 0..len {
            let index = (from + offset) % len;
            if state.purchased_course_ids.contains(&config.course_ids[index]) {
                continue;
            }
            if index < from {
                self.begin_cycle(config, &mut state);
            }
            state.enter_course(index);
            return CycleStart::Started(state);
        }
        CycleStart::AllPurchased
    }

    /// Moves to the next unpurchased course, wrapping when looping is enabled.
    pub fn next_course(&self, config: &CourseCycleConfig, state: &CourseCycleState) -> LoopDecision {
        let unpurchased = |i: &usize| !state.purchased_course_ids.contains(&config.course_ids[*i]);
        let len = config.course_ids.len();

        if let Some(index) = (state.current_course_index + 1..len).find(unpurchased) {
            let mut next = state.clone();
            next.enter_course(index);
            return LoopDecision::Next(next);
        }
        if (0..len).find(unpurchased).is_none() {
            return LoopDecision::AllPurchased;
        }
        if !config.loop_on_completion {
            return LoopDecision::Finished;
        }

        let mut next = state.clone();
        self.begin_cycle(config, &mut next);
        match (0..len).find(unpurchased) {
            Some(index) => {
                next.enter_course(index);
                LoopDecision::Looped(next)
            }
            None => LoopDecision::AllPurchased,
        }
    }

    fn begin_cycle(&self, config: &CourseCycleConfig, state: &mut CourseCycleState) {
        state.cycle_count += 1;
        if config.different_content_on_second_cycle {
            state.content_set = ContentSet::Alternate;
        }
    }

    /// Repitch while the policy allows, otherwise advance.
    pub fn on_not_purchased(&self, config: &CourseCycleConfig, state: &CourseCycleState) -> NotPurchased {
        match config.not_purchased_policy {
            NotPurchasedPolicy::Repitch { max_repitches } if state.repitch_count < max_repitches => {
                let mut next = state.clone();
                next.repitch_count += 1;
                next.phase = CyclePhase::Pitch;
                next.email_index = 0;
                NotPurchased::Repitch(next)
            }
            _ => NotPurchased::Advance,
        }
    }

    /// Schedules what follows the email just sent from `state`.
    pub fn after_send(
        &self,
        timing: &CourseTiming,
        state: &CourseCycleState,
        node_id: &str,
        node_phase: Option<CyclePhase>,
        actions: u32,
        now: DateTime<Utc>,
    ) -> EmailFollowUp {
        let mut next = state.clone();
        let (delay_days, leave) = match state.phase {
            CyclePhase::Nurture if state.email_index + 1 < timing.nurture_email_count => {
                next.email_index += 1;
                (timing.nurture_delay_days, false)
            }
            CyclePhase::Nurture => {
                next.phase = CyclePhase::Pitch;
                next.email_index = 0;
                (timing.pitch_delay_days, node_phase == Some(CyclePhase::Nurture))
            }
            CyclePhase::Pitch if state.email_index + 1 < timing.pitch_email_count => {
                next.email_index += 1;
                (timing.pitch_delay_days, false)
            }
            CyclePhase::Pitch => (timing.purchase_check_delay_days, true),
        };

        match timing.timing_mode {
            TimingMode::Fixed => {
                let at = now + Duration::days(i64::from(delay_days));
                if leave {
                    EmailFollowUp::Leave { state: next, at }
                } else {
                    EmailFollowUp::SendNextAt { state: next, at }
                }
            }
            TimingMode::Engagement => EmailFollowUp::AwaitEngagement {
                state: next,
                wait: EngagementWait {
                    node_id: node_id.to_string(),
                    deadline: now
                        + Duration::days(i64::from(timing.engagement_wait_days.unwrap_or(delay_days))),
                    baseline_actions: actions,
                    min_actions: timing.min_engagement_actions.unwrap_or(1),
                    exit_after: leave,
                },
            },
        }
    }
}

/// Rejects configs the rotation cannot run.
pub fn validate_config(config: &CourseCycleConfig) -> EngineResult<()> {
    if config.name.trim().is_empty() {
        return Err(EngineError::Config("Course cycle needs a name".into()));
    }
    if config.course_ids.is_empty() {
        return Err(EngineError::Config(
            "Course cycle needs at least one course".into(),
        ));
    }
    let mut seen = HashSet::new();
    for course_id in &config.course_ids {
        if !seen.insert(course_id.as_str()) {
            return Err(EngineError::Config(format!(
                "Course {course_id} appears twice in the playlist"
            )));
        }
        let timing = config.timing(course_id).ok_or_else(|| {
            EngineError::Config(format!("Missing timing for course {course_id}"))
        })?;
        if timing.nurture_email_count == 0 || timing.pitch_email_count == 0 {
            return Err(EngineError::Config(format!(
                "Course {course_id} needs at least one nurture and one pitch email"
            )));
        }
        if timing.timing_mode == TimingMode::Engagement
            && (timing.engagement_wait_days.is_none() || timing.min_engagement_actions.is_none())
        {
            return Err(EngineError::Config(format!(
                "Course {course_id} uses engagement timing without engagementWaitDays and minEngagementActions"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nurture_core::memory::StaticContentGenerator;

    fn timing(course_id: &str) -> CourseTiming {
        CourseTiming {
            course_id: course_id.into(),
            timing_mode: TimingMode::Fixed,
            nurture_email_count: 2,
            nurture_delay_days: 1,
            pitch_email_count: 1,
            pitch_delay_days: 2,
            purchase_check_delay_days: 3,
            engagement_wait_days: None,
            min_engagement_actions: None,
        }
    }

    fn playlist(looping: bool) -> CourseCycleConfig {
        let mut config = CourseCycleConfig::new(
            "Producer path",
            vec![timing("mixing"), timing("mastering"), timing("sound-design")],
        );
        config.loop_on_completion = looping;
        config.different_content_on_second_cycle = true;
        config
    }

    fn controller() -> CourseCycleController {
        CourseCycleController::new(None, StdDuration::from_millis(100))
    }

    fn started(ctl: &CourseCycleController, config: &CourseCycleConfig) -> CourseCycleState {
        match ctl.start(config, None, &BTreeSet::new()) {
            CycleStart::Started(state) => state,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_config_validation() {
        let ctl = controller();
        let mut config = playlist(true);
        config.course_ids.push("missing".into());
        assert!(matches!(ctl.save_config(config), Err(EngineError::Config(_))));

        let mut config = playlist(true);
        config.course_timings[0].timing_mode = TimingMode::Engagement;
        assert!(ctl.save_config(config.clone()).is_err());
        config.course_timings[0].engagement_wait_days = Some(3);
        config.course_timings[0].min_engagement_actions = Some(2);
        assert!(ctl.save_config(config).is_ok());

        let empty = CourseCycleConfig::new("Empty", Vec::new());
        assert!(ctl.save_config(empty).is_err());
    }

    #[test]
    fn test_start_skips_purchased_courses() {
        let ctl = controller();
        let config = playlist(true);
        let purchased = BTreeSet::from(["mixing".to_string()]);
        let CycleStart::Started(state) = ctl.start(&config, None, &purchased) else {
            panic!("expected a start");
        };
        assert_eq!(state.current_course_index, 1);
        assert_eq!(state.cycle_count, 0);
        assert!(state.purchased_course_ids.contains("mixing"));

        let all: BTreeSet<String> = config.course_ids.iter().cloned().collect();
        assert_eq!(ctl.start(&config, None, &all), CycleStart::AllPurchased);
    }

    #[test]
    fn test_loop_resets_index_and_switches_content() {
        let ctl = controller();
        let config = playlist(true);
        let mut state = started(&ctl, &config);

        for expected in [1, 2] {
            match ctl.next_course(&config, &state) {
                LoopDecision::Next(next) => state = next,
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(state.current_course_index, expected);
        }

        let LoopDecision::Looped(looped) = ctl.next_course(&config, &state) else {
            panic!("expected loop");
        };
        assert_eq!(looped.current_course_index, 0);
        assert_eq!(looped.cycle_count, 1);
        assert_eq!(looped.content_set, ContentSet::Alternate);
        assert_eq!(looped.phase, CyclePhase::Nurture);
    }

    #[test]
    fn test_finish_without_loop() {
        let ctl = controller();
        let config = playlist(false);
        let mut state = started(&ctl, &config);
        state.current_course_index = 2;
        assert_eq!(ctl.next_course(&config, &state), LoopDecision::Finished);

        state.purchased_course_ids = config.course_ids.iter().cloned().collect();
        assert_eq!(ctl.next_course(&config, &state), LoopDecision::AllPurchased);
    }

    #[test]
    fn test_repitch_policy() {
        let ctl = controller();
        let mut config = playlist(true);
        config.not_purchased_policy = NotPurchasedPolicy::Repitch { max_repitches: 1 };
        let state = started(&ctl, &config);

        let NotPurchased::Repitch(repitched) = ctl.on_not_purchased(&config, &state) else {
            panic!("expected repitch");
        };
        assert_eq!(repitched.phase, CyclePhase::Pitch);
        assert_eq!(repitched.repitch_count, 1);
        assert_eq!(ctl.on_not_purchased(&config, &repitched), NotPurchased::Advance);
    }

    #[test]
    fn test_fixed_pacing() {
        let ctl = controller();
        let config = playlist(true);
        let timing = config.timing("mixing").unwrap();
        let now = Utc::now();
        let state = started(&ctl, &config);

        let EmailFollowUp::SendNextAt { state, at } = ctl.after_send(timing, &state, "ce", None, 0, now) else {
            panic!("expected second nurture");
        };
        assert_eq!((state.phase, state.email_index), (CyclePhase::Nurture, 1));
        assert_eq!(at, now + Duration::days(1));

        let EmailFollowUp::SendNextAt { state, at } = ctl.after_send(timing, &state, "ce", None, 0, now) else {
            panic!("expected first pitch");
        };
        assert_eq!((state.phase, state.email_index), (CyclePhase::Pitch, 0));
        assert_eq!(at, now + Duration::days(2));

        let EmailFollowUp::Leave { at, .. } = ctl.after_send(timing, &state, "ce", None, 0, now) else {
            panic!("expected purchase check");
        };
        assert_eq!(at, now + Duration::days(3));
    }

    #[test]
    fn test_engagement_wait_race() {
        let ctl = controller();
        let mut config = playlist(true);
        config.course_timings[0].timing_mode = TimingMode::Engagement;
        config.course_timings[0].engagement_wait_days = Some(4);
        config.course_timings[0].min_engagement_actions = Some(2);
        let timing = config.timing("mixing").unwrap().clone();
        let now = Utc::now();
        let state = started(&ctl, &config);

        let EmailFollowUp::AwaitEngagement { wait, .. } = ctl.after_send(&timing, &state, "ce", None, 5, now) else {
            panic!("expected engagement wait");
        };
        assert_eq!(wait.deadline, now + Duration::days(4));
        assert!(!wait.is_resolved(6, now + Duration::days(1)));
        assert!(wait.is_resolved(7, now + Duration::days(1)));
        assert!(wait.is_resolved(5, now + Duration::days(4)));
    }

    #[tokio::test]
    async fn test_content_prefers_stored_then_generates() {
        let generator = Arc::new(StaticContentGenerator::new());
        let ctl = CourseCycleController::new(Some(generator.clone()), StdDuration::from_secs(1));
        let config = ctl.save_config(playlist(true)).unwrap();
        let state = started(&ctl, &config);

        let stored = ctl
            .save_cycle_email(CycleEmail::new(
                config.id,
                "mixing",
                CyclePhase::Nurture,
                0,
                ContentSet::Primary,
                "Why your mixes sound muddy",
                "<p>EQ first.</p>",
            ))
            .unwrap();
        let content = ctl.content_for(&state).await.unwrap();
        assert_eq!(content.id, stored.id);
        assert!(generator.requests().is_empty());

        let mut second = state.clone();
        second.email_index = 1;
        let generated = ctl.content_for(&second).await.unwrap();
        assert!(generated.generated);
        assert_eq!(generator.requests().len(), 1);
        // Cached for the next contact.
        assert_eq!(ctl.content_for(&second).await.unwrap().id, generated.id);
        assert_eq!(generator.requests().len(), 1);

        generator.failures.fail_always(nurture_core::CollaboratorError::Timeout(10));
        let mut third = state.clone();
        third.phase = CyclePhase::Pitch;
        assert!(ctl.content_for(&third).await.is_none());
    }

    #[test]
    fn test_cycle_email_counters_survive_edit() {
        let ctl = controller();
        let config = ctl.save_config(playlist(true)).unwrap();
        let email = CycleEmail::new(config.id, "mixing", CyclePhase::Pitch, 0, ContentSet::Primary, "Enroll", "<p>Now</p>");
        let saved = ctl.save_cycle_email(email.clone()).unwrap();
        ctl.record_sent(saved.id);
        ctl.record_email_event(saved.id, &EmailEvent::Opened);

        let mut edited = email;
        edited.subject = "Enroll today".into();
        let resaved = ctl.save_cycle_email(edited).unwrap();
        assert_eq!(resaved.id, saved.id);
        assert_eq!((resaved.sent_count, resaved.opened_count), (1, 1));
        assert_eq!(ctl.cycle_emails(config.id).len(), 1);
    }
}
