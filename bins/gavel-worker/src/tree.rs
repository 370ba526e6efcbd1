/// Test Tree - Flattening, Aggregation and Reconstruction
///
/// **Ordering rule:**
/// Inside a group the next unit is the next subgroup when its name sorts
/// before the next case's name, or when no cases remain; otherwise the next
/// case. The producer walks the tree in this order and the consumer replays
/// the same rule, so a flat stream of results maps back onto the tree
/// without carrying any identifiers.
///
/// Both sides apply `should_break` after every child, so groups cut short
/// by break-on-reject stay in step.
use crate::error::{JudgeError, JudgeResult};
use crate::plan::{EvalResult, GroupPolicy, ResultKind, ScoringMode, TestCase, TestGroup, VerdictMode};
use gavel_common::types::Verdict;

fn subgroup_first(group: &TestGroup, next_case: usize, next_group: usize) -> bool {
    next_group < group.groups.len()
        && (next_case == group.cases.len() || group.groups[next_group].name < group.cases[next_case].name)
}

/// Whether the rest of `policy`'s group is skipped after a child with `verdict`.
pub fn should_break(policy: &GroupPolicy, verdict: Verdict, evaluate_all: bool) -> bool {
    policy.break_on_reject && !verdict.is_accepted() && !evaluate_all
}

struct Frame<'a> {
    group: &'a TestGroup,
    next_case: usize,
    next_group: usize,
}

impl<'a> Frame<'a> {
    fn new(group: &'a TestGroup) -> Self {
        Self {
            group,
            next_case: 0,
            next_group: 0,
        }
    }

    fn subgroup_next(&self) -> bool {
        subgroup_first(self.group, self.next_case, self.next_group)
    }

    fn skip_remaining(&mut self) {
        self.next_case = self.group.cases.len();
        self.next_group = self.group.groups.len();
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step<'a> {
    Enter(&'a TestGroup),
    Case(&'a TestCase),
    Leave(&'a TestGroup),
}

/// Depth-first walk of a group tree in evaluation order, without recursion.
pub struct Flattener<'a> {
    root: Option<&'a TestGroup>,
    stack: Vec<Frame<'a>>,
}

impl<'a> Flattener<'a> {
    pub fn new(root: &'a TestGroup) -> Self {
        Self {
            root: Some(root),
            stack: Vec::new(),
        }
    }

    /// Skip every unit not yet produced in the innermost open group.
    pub fn skip_remaining(&mut self) {
        if let Some(frame) = self.stack.last_mut() {
            frame.skip_remaining();
        }
    }
}

impl<'a> Iterator for Flattener<'a> {
    type Item = Step<'a>;

    fn next(&mut self) -> Option<Step<'a>> {
        if let Some(root) = self.root.take() {
            self.stack.push(Frame::new(root));
            return Some(Step::Enter(root));
        }
        let frame = self.stack.last_mut()?;
        let group = frame.group;
        if frame.subgroup_next() {
            let child = &group.groups[frame.next_group];
            frame.next_group += 1;
            self.stack.push(Frame::new(child));
            return Some(Step::Enter(child));
        }
        if frame.next_case < group.cases.len() {
            let case = &group.cases[frame.next_case];
            frame.next_case += 1;
            return Some(Step::Case(case));
        }
        self.stack.pop();
        Some(Step::Leave(group))
    }
}

/// A finished child as seen by its parent's aggregation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChildOutcome {
    pub verdict: Verdict,
    pub score: f64,
    pub time_usage_ms: i64,
    /// Sample groups flagged `ignore_sample` do not count towards the score.
    pub ignored: bool,
}

impl ChildOutcome {
    pub fn of(result: &EvalResult, ignored: bool) -> Self {
        Self {
            verdict: result.verdict,
            score: result.score,
            time_usage_ms: result.time_usage_ms,
            ignored,
        }
    }
}

pub fn aggregate_score(mode: ScoringMode, children: &[ChildOutcome]) -> f64 {
    let scores: Vec<f64> = children.iter().filter(|c| !c.ignored).map(|c| c.score).collect();
    if scores.is_empty() {
        return 0.0;
    }
    match mode {
        ScoringMode::Sum => scores.iter().sum(),
        ScoringMode::Avg => scores.iter().sum::<f64>() / scores.len() as f64,
        ScoringMode::Min => scores.iter().copied().fold(f64::INFINITY, f64::min),
        ScoringMode::Max => scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    }
}

pub fn aggregate_verdict(policy: &GroupPolicy, children: &[ChildOutcome]) -> Verdict {
    if policy.accept_if_any_accepted && children.iter().any(|c| c.verdict.is_accepted()) {
        return Verdict::Accepted;
    }
    match policy.verdict_mode {
        VerdictMode::AlwaysAccept => Verdict::Accepted,
        VerdictMode::FirstError => children
            .iter()
            .map(|c| c.verdict)
            .find(|v| !v.is_accepted())
            .unwrap_or(Verdict::Accepted),
        VerdictMode::WorstError => children.iter().fold(Verdict::Accepted, |worst, c| {
            if c.verdict.severity() > worst.severity() {
                c.verdict
            } else {
                worst
            }
        }),
    }
}

/// Built-in group aggregation over children in evaluation order.
pub fn aggregate(policy: &GroupPolicy, children: &[ChildOutcome]) -> EvalResult {
    EvalResult::group(
        aggregate_verdict(policy, children),
        aggregate_score(policy.scoring_mode, children),
        children.iter().map(|c| c.time_usage_ms).max().unwrap_or(0),
    )
}

/// A tree node completed by a streamed result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Node<'a> {
    Case(&'a TestCase, EvalResult),
    Group(&'a TestGroup, EvalResult),
}

/// Maps a flat result stream back onto the plan's group tree.
pub struct Reconstructor<'a> {
    root: Option<&'a TestGroup>,
    stack: Vec<Frame<'a>>,
    finished: bool,
    evaluate_all: bool,
}

impl<'a> Reconstructor<'a> {
    pub fn new(root: &'a TestGroup, evaluate_all: bool) -> Self {
        Self {
            root: Some(root),
            stack: Vec::new(),
            finished: false,
            evaluate_all,
        }
    }

    /// Open frames for every subgroup whose turn comes before the next case.
    fn descend(&mut self) {
        if let Some(root) = self.root.take() {
            self.stack.push(Frame::new(root));
        }
        while let Some(frame) = self.stack.last_mut() {
            if !frame.subgroup_next() {
                break;
            }
            let group = frame.group;
            let child = &group.groups[frame.next_group];
            frame.next_group += 1;
            self.stack.push(Frame::new(child));
        }
    }

    fn break_if_rejected(&mut self, verdict: Verdict) {
        let evaluate_all = self.evaluate_all;
        if let Some(frame) = self.stack.last_mut() {
            if should_break(&frame.group.policy, verdict, evaluate_all) {
                frame.skip_remaining();
            }
        }
    }

    pub fn push(&mut self, result: EvalResult) -> JudgeResult<Node<'a>> {
        if self.finished {
            return Err(JudgeError::Stream("result after the root aggregate".to_string()));
        }
        self.descend();
        let frame = self
            .stack
            .last_mut()
            .ok_or_else(|| JudgeError::Stream("no open group".to_string()))?;

        match result.kind {
            ResultKind::TestCase => {
                let group = frame.group;
                let case = group.cases.get(frame.next_case).ok_or_else(|| {
                    JudgeError::Stream(format!("case result but group {} has no cases left", group.name))
                })?;
                frame.next_case += 1;
                self.break_if_rejected(result.verdict);
                Ok(Node::Case(case, result))
            }
            ResultKind::TestGroup => {
                if frame.next_case < frame.group.cases.len() {
                    return Err(JudgeError::Stream(format!(
                        "group result while group {} still has cases",
                        frame.group.name
                    )));
                }
                let group = frame.group;
                self.stack.pop();
                if self.stack.is_empty() {
                    self.finished = true;
                } else {
                    self.break_if_rejected(result.verdict);
                }
                Ok(Node::Group(group, result))
            }
        }
    }

    /// End of stream; fails unless the root aggregate arrived.
    pub fn finish(self) -> JudgeResult<()> {
        if self.finished {
            Ok(())
        } else {
            Err(JudgeError::Stream("stream ended before the root aggregate".to_string()))
        }
    }
}
