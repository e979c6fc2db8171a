//! Update policy: decides whether a container is checked and updated.
//!
//! [`evaluate`] is a pure function of its [`PolicyInput`]. Rules run in a fixed
//! priority order and the first match wins:
//!
//! 1. `watchdocker.skip=true` label: skip (beats force)
//! 2. `watchdocker.force=true` label: force, no further rules
//! 3. `only_labels` set and none present: skip
//! 4. any `skip_labels` entry present: skip
//! 5. compose project label without `allow_compose_update`: skip
//! 6. digest-pinned reference with `skip_pinned`: skip
//! 7. no local repo digests with `skip_local`: skip
//! 8. strict `v?MAJOR.MINOR.PATCH` tag with `skip_semver`: skip
//! 9. `floating_tags` set and tag not in it: skip
//!
//! Skip over force is deliberate for now; operators may expect the opposite,
//! so confirm before building anything on top of it.

use std::collections::HashMap;
use std::fmt;

use dockwatch_core::config::PolicyConfig;
use dockwatch_core::types::ContainerSnapshot;

/// Label that always skips a container.
pub const LABEL_SKIP: &str = "watchdocker.skip";

/// Label that forces a check regardless of the remaining rules.
pub const LABEL_FORCE: &str = "watchdocker.force";

/// Label set by compose on every service container.
pub const LABEL_COMPOSE_PROJECT: &str = "com.docker.compose.project";

/// Why a container was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    LabelSkip,
    OnlyLabelsFilter,
    ComposeManaged,
    PinnedDigest,
    LocalBuild,
    PinnedSemver,
    TagNotFloating,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LabelSkip => "label skip",
            Self::OnlyLabelsFilter => "onlyLabels filter",
            Self::ComposeManaged => "compose managed",
            Self::PinnedDigest => "pinned digest",
            Self::LocalBuild => "local build",
            Self::PinnedSemver => "pinned semver",
            Self::TagNotFloating => "tag not in floating list",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Decision {
    pub skipped: bool,
    pub reason: Option<SkipReason>,
    /// Set by the force label. Callers continue even if other rules would skip.
    pub force: bool,
}

impl Decision {
    fn skip(reason: SkipReason) -> Self {
        Self {
            skipped: true,
            reason: Some(reason),
            force: false,
        }
    }

    fn forced() -> Self {
        Self {
            skipped: false,
            reason: None,
            force: true,
        }
    }

    /// Reason text, empty when not skipped.
    pub fn reason_str(&self) -> &'static str {
        self.reason.map(|r| r.as_str()).unwrap_or("")
    }

    /// True when the container must not be checked.
    pub fn is_skip(&self) -> bool {
        self.skipped && !self.force
    }
}

/// Everything the policy looks at, borrowed from a snapshot and the policy config.
#[derive(Debug, Clone, Copy)]
pub struct PolicyInput<'a> {
    pub image_ref: &'a str,
    pub repo_digests: &'a [String],
    pub labels: &'a HashMap<String, String>,
    pub floating_tags: &'a [String],
    pub skip_local: bool,
    pub skip_pinned: bool,
    pub skip_semver: bool,
    pub only_labels: &'a [String],
    pub skip_labels: &'a [String],
    pub allow_compose_update: bool,
}

impl<'a> PolicyInput<'a> {
    pub fn new(
        snapshot: &'a ContainerSnapshot,
        policy: &'a PolicyConfig,
        allow_compose_update: bool,
    ) -> Self {
        Self {
            image_ref: &snapshot.image,
            repo_digests: &snapshot.repo_digests,
            labels: &snapshot.labels,
            floating_tags: &policy.floating_tags,
            skip_local: policy.skip_local_build,
            skip_pinned: policy.skip_pinned_digest,
            skip_semver: policy.skip_semver_pinned,
            only_labels: &policy.only_labels,
            skip_labels: &policy.skip_labels,
            allow_compose_update,
        }
    }
}

/// Evaluates the rules in priority order.
pub fn evaluate(input: &PolicyInput<'_>) -> Decision {
    if label_is_true(input.labels, LABEL_SKIP) {
        return Decision::skip(SkipReason::LabelSkip);
    }
    if label_is_true(input.labels, LABEL_FORCE) {
        return Decision::forced();
    }

    if !input.only_labels.is_empty()
        && !input
            .only_labels
            .iter()
            .any(|selector| label_selector_matches(input.labels, selector))
    {
        return Decision::skip(SkipReason::OnlyLabelsFilter);
    }

    if input
        .skip_labels
        .iter()
        .any(|selector| label_selector_matches(input.labels, selector))
    {
        return Decision::skip(SkipReason::LabelSkip);
    }

    let compose_managed = input
        .labels
        .get(LABEL_COMPOSE_PROJECT)
        .is_some_and(|v| !v.is_empty());
    if compose_managed && !input.allow_compose_update {
        return Decision::skip(SkipReason::ComposeManaged);
    }

    if input.skip_pinned && input.image_ref.contains("@sha256:") {
        return Decision::skip(SkipReason::PinnedDigest);
    }

    if input.skip_local && input.repo_digests.is_empty() {
        return Decision::skip(SkipReason::LocalBuild);
    }

    let tag = image_tag(input.image_ref);

    if input.skip_semver && is_strict_semver(tag) {
        return Decision::skip(SkipReason::PinnedSemver);
    }

    if !input.floating_tags.is_empty()
        && !input
            .floating_tags
            .iter()
            .any(|t| t.eq_ignore_ascii_case(tag))
    {
        return Decision::skip(SkipReason::TagNotFloating);
    }

    Decision::default()
}

/// Text after the last `:` of the reference, `latest` when there is none.
pub fn image_tag(image_ref: &str) -> &str {
    match image_ref.rfind(':') {
        Some(idx) => &image_ref[idx + 1..],
        None => "latest",
    }
}

/// `v?MAJOR.MINOR.PATCH` with ASCII digits that also parses as semver.
pub fn is_strict_semver(tag: &str) -> bool {
    let bare = tag.strip_prefix('v').unwrap_or(tag);
    let mut parts = 0;
    for part in bare.split('.') {
        parts += 1;
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
    }
    parts == 3 && semver::Version::parse(bare).is_ok()
}

fn label_is_true(labels: &HashMap<String, String>, key: &str) -> bool {
    labels
        .get(key)
        .is_some_and(|v| v.to_lowercase() == "true")
}

/// `key=value` needs an exact value match, a bare `key` only needs presence.
fn label_selector_matches(labels: &HashMap<String, String>, selector: &str) -> bool {
    match selector.split_once('=') {
        Some((key, value)) => labels.get(key).is_some_and(|v| v == value),
        None => labels.contains_key(selector),
    }
}
