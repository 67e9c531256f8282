//! Static campaign definitions: step offsets and template rules per campaign.

use outreach_channels::templates::{EmailTemplate, TemplateLibrary};
use outreach_core::types::{CampaignType, Segment};
use outreach_core::{OutreachError, OutreachResult};

/// How a step picks its template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateRule {
    /// Same template id for every segment.
    Universal(&'static str),
    /// Id prefix completed with the lowercase segment, e.g. `nurture_step2_optimize`.
    BySegment(&'static str),
}

impl TemplateRule {
    pub fn resolve(&self, segment: Segment) -> String {
        match self {
            TemplateRule::Universal(id) => (*id).to_string(),
            TemplateRule::BySegment(prefix) => format!("{prefix}_{}", segment.slug()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepDefinition {
    /// Cumulative offset from step 1, in production hours.
    pub offset_hours: u32,
    pub template: TemplateRule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceDefinition {
    pub campaign: CampaignType,
    pub steps: &'static [StepDefinition],
}

impl SequenceDefinition {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// 1-based lookup.
    pub fn step(&self, step_index: u32) -> OutreachResult<&'static StepDefinition> {
        let steps: &'static [StepDefinition] = self.steps;
        step_index
            .checked_sub(1)
            .and_then(|i| steps.get(i as usize))
            .ok_or(OutreachError::InvalidStep {
                campaign: self.campaign,
                step: step_index,
                steps: self.len(),
            })
    }

    pub fn template_id(&self, step_index: u32, segment: Segment) -> OutreachResult<String> {
        Ok(self.step(step_index)?.template.resolve(segment))
    }

    pub fn is_final(&self, step_index: u32) -> bool {
        step_index as usize == self.len()
    }

    pub fn step_indexes(&self) -> Vec<u32> {
        (1..=self.len() as u32).collect()
    }
}

const fn universal(offset_hours: u32, id: &'static str) -> StepDefinition {
    StepDefinition {
        offset_hours,
        template: TemplateRule::Universal(id),
    }
}

const fn by_segment(offset_hours: u32, prefix: &'static str) -> StepDefinition {
    StepDefinition {
        offset_hours,
        template: TemplateRule::BySegment(prefix),
    }
}

static NURTURE: [StepDefinition; 7] = [
    universal(0, "nurture_step1"),
    by_segment(24, "nurture_step2"),
    by_segment(72, "nurture_step3"),
    universal(120, "nurture_step4"),
    by_segment(168, "nurture_step5"),
    universal(240, "nurture_step6"),
    universal(336, "nurture_step7"),
];

static NO_SHOW: [StepDefinition; 4] = [
    universal(0, "no_show_step1"),
    by_segment(4, "no_show_step2"),
    universal(24, "no_show_step3"),
    universal(72, "no_show_step4"),
];

static POST_CALL: [StepDefinition; 5] = [
    by_segment(0, "post_call_step1"),
    universal(24, "post_call_step2"),
    by_segment(72, "post_call_step3"),
    universal(168, "post_call_step4"),
    universal(336, "post_call_step5"),
];

static ONBOARDING: [StepDefinition; 6] = [
    universal(0, "onboarding_step1"),
    by_segment(24, "onboarding_step2"),
    universal(72, "onboarding_step3"),
    universal(168, "onboarding_step4"),
    universal(336, "onboarding_step5"),
    universal(720, "onboarding_step6"),
];

pub fn definition(campaign: CampaignType) -> SequenceDefinition {
    let steps: &'static [StepDefinition] = match campaign {
        CampaignType::Nurture => &NURTURE,
        CampaignType::NoShow => &NO_SHOW,
        CampaignType::PostCall => &POST_CALL,
        CampaignType::Onboarding => &ONBOARDING,
    };
    SequenceDefinition { campaign, steps }
}

/// Every template id any definition can resolve to.
pub fn all_template_ids() -> Vec<String> {
    let mut ids = Vec::new();
    for campaign in CampaignType::ALL {
        for step in definition(campaign).steps {
            match step.template {
                TemplateRule::Universal(id) => ids.push(id.to_string()),
                TemplateRule::BySegment(_) => {
                    ids.extend(Segment::ALL.iter().map(|s| step.template.resolve(*s)))
                }
            }
        }
    }
    ids
}

/// Built-in copy for every step template, keyed by the ids above.
pub fn default_templates() -> Vec<EmailTemplate> {
    let mut templates = Vec::new();
    for campaign in CampaignType::ALL {
        let def = definition(campaign);
        for (i, step) in def.steps.iter().enumerate() {
            let index = i as u32 + 1;
            let subject = step_subject(campaign, index);
            match step.template {
                TemplateRule::Universal(id) => templates.push(EmailTemplate::new(
                    id,
                    subject,
                    format!("Hi {{{{display_name}}}},\n\n{}", step_body(campaign, index)),
                )),
                TemplateRule::BySegment(_) => {
                    for segment in Segment::ALL {
                        templates.push(EmailTemplate::new(
                            step.template.resolve(segment),
                            subject,
                            format!(
                                "Hi {{{{display_name}}}},\n\n{} {}",
                                segment_opener(segment),
                                step_body(campaign, index)
                            ),
                        ));
                    }
                }
            }
        }
    }
    templates
}

/// Register the built-in templates. Returns how many were added.
pub fn seed_library(library: &TemplateLibrary) -> usize {
    let templates = default_templates();
    let count = templates.len();
    for template in templates {
        library.register(template);
    }
    count
}

fn segment_opener(segment: Segment) -> &'static str {
    match segment {
        Segment::Critical => "A few things at {{account_name}} need attention right away.",
        Segment::Urgent => "There are some quick wins waiting for {{account_name}}.",
        Segment::Optimize => "{{account_name}} is in good shape, and there is room to do even better.",
    }
}

fn step_subject(campaign: CampaignType, step: u32) -> &'static str {
    match (campaign, step) {
        (CampaignType::Nurture, 1) => "Your results for {{account_name}}",
        (CampaignType::Nurture, 2) => "What your results mean",
        (CampaignType::Nurture, 3) => "The first fix we would make",
        (CampaignType::Nurture, 4) => "How teams like yours approach this",
        (CampaignType::Nurture, 5) => "A plan for {{account_name}}",
        (CampaignType::Nurture, 6) => "Still thinking it over?",
        (CampaignType::Nurture, _) => "One last note",
        (CampaignType::NoShow, 1) => "Sorry we missed you",
        (CampaignType::NoShow, 2) => "Want to pick a new time?",
        (CampaignType::NoShow, 3) => "Your calendar link",
        (CampaignType::NoShow, _) => "Closing the loop",
        (CampaignType::PostCall, 1) => "Thanks for the call",
        (CampaignType::PostCall, 2) => "Your recap",
        (CampaignType::PostCall, 3) => "Next steps for {{account_name}}",
        (CampaignType::PostCall, 4) => "Any questions?",
        (CampaignType::PostCall, _) => "Checking in",
        (CampaignType::Onboarding, 1) => "Welcome aboard",
        (CampaignType::Onboarding, 2) => "Your first week",
        (CampaignType::Onboarding, 3) => "Getting the most out of your setup",
        (CampaignType::Onboarding, 4) => "Tips from other customers",
        (CampaignType::Onboarding, 5) => "How is it going?",
        (CampaignType::Onboarding, _) => "Your first month",
    }
}

fn step_body(campaign: CampaignType, step: u32) -> String {
    let lead = match campaign {
        CampaignType::Nurture => "Here is the next part of your {{segment}} review.",
        CampaignType::NoShow => "We were sorry to miss you.",
        CampaignType::PostCall => "Thanks again for speaking with us.",
        CampaignType::Onboarding => "Welcome to the team.",
    };
    format!("{lead} (Step {step} of {})", definition(campaign).len())
}
