use std::collections::HashSet;

use crate::item::{Prd, Story, StoryStatus};

/// Validator outcome. Validators are deterministic and pure: they depend
/// only on artifact content and never fail themselves. Problems land in
/// `defects` and the phase runner turns a non-empty list into a typed
/// quality error.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Validation {
    pub defects: Vec<String>,
}

impl Validation {
    pub fn valid(&self) -> bool {
        self.defects.is_empty()
    }

    fn defect(&mut self, msg: impl Into<String>) {
        self.defects.push(msg.into());
    }
}

pub const RESEARCH_SECTIONS: [&str; 7] = [
    "Summary",
    "Current State Analysis",
    "Key Files",
    "Technical Considerations",
    "Risks and Mitigations",
    "Recommended Approach",
    "Open Questions",
];

pub const PLAN_SECTIONS: [&str; 5] = [
    "Overview",
    "Current State",
    "Desired End State",
    "What We're NOT Doing",
    "Implementation Approach",
];

/// Validate a research.md document.
///
/// Checks for the required section headers, at least one paragraph under
/// each, and at least one file-path-like citation under "Key Files".
pub fn validate_research(content: &str) -> Validation {
    let mut v = Validation::default();
    let sections = split_sections(content);

    for required in RESEARCH_SECTIONS {
        match find_section(&sections, required) {
            None => v.defect(format!("missing section '{}'", required)),
            Some(body) => {
                if paragraph_count(body) == 0 {
                    v.defect(format!("section '{}' is empty", required));
                }
            }
        }
    }

    if let Some(body) = find_section(&sections, "Key Files") {
        if !body.lines().any(looks_like_file_path) {
            v.defect("'Key Files' contains no file-path citations");
        }
    }

    v
}

/// Validate a plan.md document.
///
/// Checks for the required sections plus at least one "Phase N" section
/// containing a "Success Criteria" list.
pub fn validate_plan(content: &str) -> Validation {
    let mut v = Validation::default();
    let sections = split_sections(content);

    for required in PLAN_SECTIONS {
        if find_section(&sections, required).is_none() {
            v.defect(format!("missing section '{}'", required));
        }
    }

    let phase_sections: Vec<&(String, String)> = sections
        .iter()
        .filter(|(title, _)| is_phase_heading(title))
        .collect();

    if phase_sections.is_empty() {
        v.defect("no 'Phase N' sections found");
    } else {
        for (title, body) in &phase_sections {
            if !body.to_lowercase().contains("success criteria") {
                v.defect(format!("'{}' has no Success Criteria subsection", title));
            }
        }
    }

    v
}

/// Validate PRD structure: unique story ids, non-empty acceptance criteria
/// per story. Status legality is enforced by the enum at parse time; a raw
/// status string that failed to parse never reaches this function.
pub fn validate_prd(prd: &Prd) -> Validation {
    let mut v = Validation::default();

    if prd.stories.is_empty() {
        v.defect("PRD contains no stories");
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for story in &prd.stories {
        if !seen.insert(story.id.as_str()) {
            v.defect(format!("duplicate story id '{}'", story.id));
        }
        for defect in validate_story(story).defects {
            v.defect(defect);
        }
    }

    v
}

/// Per-story checks, also used during the implement phase to accept or
/// reject a just-completed story.
pub fn validate_story(story: &Story) -> Validation {
    let mut v = Validation::default();

    if story.id.trim().is_empty() {
        v.defect("story has an empty id");
    }
    if story.title.trim().is_empty() {
        v.defect(format!("story '{}' has an empty title", story.id));
    }
    if story.acceptance_criteria.is_empty()
        || story.acceptance_criteria.iter().all(|c| c.trim().is_empty())
    {
        v.defect(format!(
            "story '{}' has no acceptance criteria",
            story.id
        ));
    }

    v
}

/// Accept a story the agent just reported complete: structural checks plus
/// the status must actually have moved to done.
pub fn validate_completed_story(story: &Story) -> Validation {
    let mut v = validate_story(story);
    if story.status != StoryStatus::Done {
        v.defect(format!(
            "story '{}' was not marked done by the agent",
            story.id
        ));
    }
    v
}

// --- Markdown helpers ---

/// Split markdown into (heading, body) pairs on `##` headings. Content
/// before the first heading is ignored. Deeper headings (`###`) stay inside
/// their parent's body.
fn split_sections(content: &str) -> Vec<(String, String)> {
    let mut sections: Vec<(String, String)> = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in content.lines() {
        let trimmed = line.trim_start();
        let is_h2 = trimmed.starts_with("## ") && !trimmed.starts_with("###");
        if is_h2 {
            if let Some((title, body)) = current.take() {
                sections.push((title, body.join("\n")));
            }
            current = Some((trimmed[3..].trim().to_string(), Vec::new()));
        } else if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }

    if let Some((title, body)) = current.take() {
        sections.push((title, body.join("\n")));
    }

    sections
}

fn find_section<'a>(sections: &'a [(String, String)], name: &str) -> Option<&'a str> {
    sections
        .iter()
        .find(|(title, _)| title.eq_ignore_ascii_case(name))
        .map(|(_, body)| body.as_str())
}

/// Count paragraphs: runs of non-empty lines separated by blank lines.
fn paragraph_count(body: &str) -> usize {
    let mut count = 0;
    let mut in_paragraph = false;
    for line in body.lines() {
        if line.trim().is_empty() {
            in_paragraph = false;
        } else if !in_paragraph {
            count += 1;
            in_paragraph = true;
        }
    }
    count
}

/// Heuristic for a file-path citation: a token containing a slash or a
/// dotted file name (e.g. `src/main.rs`, `Cargo.toml`).
fn looks_like_file_path(line: &str) -> bool {
    line.split(|c: char| c.is_whitespace() || matches!(c, '`' | '*' | '(' | ')' | ',' | ':'))
        .any(|token| {
            let token = token.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '/' && c != '.');
            if token.is_empty() || token.starts_with("http") {
                return false;
            }
            token.contains('/')
                || (token.contains('.')
                    && !token.ends_with('.')
                    && token.chars().next().is_some_and(|c| c.is_ascii_alphanumeric()))
        })
}

/// Heading like "Phase 1", "Phase 2: Rollout".
fn is_phase_heading(title: &str) -> bool {
    let rest = match title.strip_prefix("Phase ") {
        Some(r) => r,
        None => return false,
    };
    rest.chars().next().is_some_and(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Story;

    fn full_research() -> String {
        let mut doc = String::new();
        for section in RESEARCH_SECTIONS {
            doc.push_str(&format!("## {}\n\n", section));
            if section == "Key Files" {
                doc.push_str("- `src/main.rs` — entry point\n\n");
            } else {
                doc.push_str("Some analysis paragraph.\n\n");
            }
        }
        doc
    }

    #[test]
    fn complete_research_passes() {
        let v = validate_research(&full_research());
        assert!(v.valid(), "defects: {:?}", v.defects);
    }

    #[test]
    fn missing_summary_is_reported_by_name() {
        let doc = full_research().replace("## Summary\n\nSome analysis paragraph.\n\n", "");
        let v = validate_research(&doc);
        assert!(!v.valid());
        assert!(v.defects.iter().any(|d| d.contains("'Summary'")));
    }

    #[test]
    fn empty_section_is_a_defect() {
        let doc = full_research().replace(
            "## Open Questions\n\nSome analysis paragraph.\n\n",
            "## Open Questions\n\n",
        );
        let v = validate_research(&doc);
        assert!(v.defects.iter().any(|d| d.contains("Open Questions")));
    }

    #[test]
    fn key_files_without_paths_is_a_defect() {
        let doc = full_research().replace("- `src/main.rs` — entry point", "nothing concrete here");
        let v = validate_research(&doc);
        assert!(v
            .defects
            .iter()
            .any(|d| d.contains("file-path citations")));
    }

    fn full_plan() -> String {
        let mut doc = String::new();
        for section in PLAN_SECTIONS {
            doc.push_str(&format!("## {}\n\nContent.\n\n", section));
        }
        doc.push_str("## Phase 1: Foundation\n\n### Success Criteria\n\n- [ ] compiles\n\n");
        doc.push_str("## Phase 2: Rollout\n\n### Success Criteria\n\n- [ ] shipped\n\n");
        doc
    }

    #[test]
    fn complete_plan_passes() {
        let v = validate_plan(&full_plan());
        assert!(v.valid(), "defects: {:?}", v.defects);
    }

    #[test]
    fn plan_without_phases_fails() {
        let mut doc = String::new();
        for section in PLAN_SECTIONS {
            doc.push_str(&format!("## {}\n\nContent.\n\n", section));
        }
        let v = validate_plan(&doc);
        assert!(v.defects.iter().any(|d| d.contains("Phase N")));
    }

    #[test]
    fn phase_without_success_criteria_fails() {
        let doc = full_plan().replace(
            "## Phase 2: Rollout\n\n### Success Criteria\n\n- [ ] shipped\n\n",
            "## Phase 2: Rollout\n\nJust vibes.\n\n",
        );
        let v = validate_plan(&doc);
        assert!(v.defects.iter().any(|d| d.contains("Phase 2")));
    }

    fn story(id: &str, criteria: &[&str]) -> Story {
        Story {
            id: id.to_string(),
            title: format!("Story {}", id),
            acceptance_criteria: criteria.iter().map(|c| c.to_string()).collect(),
            status: StoryStatus::Pending,
            notes: None,
        }
    }

    #[test]
    fn prd_duplicate_ids_rejected() {
        let prd = Prd {
            stories: vec![story("US-001", &["a"]), story("US-001", &["b"])],
        };
        let v = validate_prd(&prd);
        assert!(v.defects.iter().any(|d| d.contains("duplicate")));
    }

    #[test]
    fn prd_empty_criteria_rejected() {
        let prd = Prd {
            stories: vec![story("US-001", &[])],
        };
        let v = validate_prd(&prd);
        assert!(v.defects.iter().any(|d| d.contains("acceptance criteria")));
    }

    #[test]
    fn prd_valid_passes() {
        let prd = Prd {
            stories: vec![story("US-001", &["works"]), story("US-002", &["tested"])],
        };
        assert!(validate_prd(&prd).valid());
    }

    #[test]
    fn completed_story_must_be_done() {
        let mut s = story("US-001", &["works"]);
        let v = validate_completed_story(&s);
        assert!(v.defects.iter().any(|d| d.contains("not marked done")));

        s.status = StoryStatus::Done;
        assert!(validate_completed_story(&s).valid());
    }
}
