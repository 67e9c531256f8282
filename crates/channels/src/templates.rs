//! Email template rendering with `{{variable}}` substitution.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use outreach_core::types::CampaignType;
use outreach_core::OutreachResult;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub type TemplateVars = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedContent {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailTemplate {
    pub id: String,
    pub subject: String,
    pub body: String,
}

impl EmailTemplate {
    pub fn new(id: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }

    pub fn render(&self, vars: &TemplateVars) -> RenderedContent {
        RenderedContent {
            subject: substitute(&self.subject, vars),
            body: substitute(&self.body, vars),
        }
    }
}

/// Placeholders with no matching variable are left in place.
fn substitute(text: &str, vars: &TemplateVars) -> String {
    let mut result = text.to_string();
    for (name, value) in vars {
        let placeholder = format!("{{{{{name}}}}}");
        result = result.replace(&placeholder, value);
    }
    result
}

/// Resolves a template id to rendered content. `Ok(None)` means the id is
/// unknown; errors mean the lookup itself failed.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn render(
        &self,
        template_id: &str,
        vars: &TemplateVars,
    ) -> OutreachResult<Option<RenderedContent>>;
}

/// In-process template store.
#[derive(Default)]
pub struct TemplateLibrary {
    templates: DashMap<String, EmailTemplate>,
}

impl TemplateLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, template: EmailTemplate) {
        self.templates.insert(template.id.clone(), template);
    }

    pub fn remove(&self, template_id: &str) -> Option<EmailTemplate> {
        self.templates.remove(template_id).map(|(_, t)| t)
    }

    pub fn get(&self, template_id: &str) -> Option<EmailTemplate> {
        self.templates.get(template_id).map(|t| t.clone())
    }

    pub fn contains(&self, template_id: &str) -> bool {
        self.templates.contains_key(template_id)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[async_trait]
impl TemplateSource for TemplateLibrary {
    async fn render(
        &self,
        template_id: &str,
        vars: &TemplateVars,
    ) -> OutreachResult<Option<RenderedContent>> {
        let rendered = self.templates.get(template_id).map(|t| t.render(vars));
        if rendered.is_none() {
            debug!(template_id, "Template not found");
        }
        Ok(rendered)
    }
}

/// Generic per-campaign templates used when a step's own template cannot be
/// resolved.
#[derive(Debug, Clone, Default)]
pub struct FallbackCatalog {
    templates: HashMap<CampaignType, EmailTemplate>,
}

impl FallbackCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// One fallback for every campaign type.
    pub fn with_defaults() -> Self {
        let templates = CampaignType::ALL
            .into_iter()
            .map(|campaign| (campaign, default_fallback(campaign)))
            .collect();
        Self { templates }
    }

    pub fn set(&mut self, campaign: CampaignType, template: EmailTemplate) {
        self.templates.insert(campaign, template);
    }

    pub fn without(mut self, campaign: CampaignType) -> Self {
        self.templates.remove(&campaign);
        self
    }

    pub fn get(&self, campaign: CampaignType) -> Option<&EmailTemplate> {
        self.templates.get(&campaign)
    }

    pub fn render(&self, campaign: CampaignType, vars: &TemplateVars) -> Option<(String, RenderedContent)> {
        self.get(campaign).map(|t| (t.id.clone(), t.render(vars)))
    }
}

fn default_fallback(campaign: CampaignType) -> EmailTemplate {
    let (subject, body) = match campaign {
        CampaignType::Nurture => (
            "A few ideas for {{account_name}}",
            "Hi {{display_name}},\n\nWe put together some next steps for {{account_name}}. Reply to this email and we will walk you through them.",
        ),
        CampaignType::NoShow => (
            "Sorry we missed you, {{display_name}}",
            "Hi {{display_name}},\n\nWe missed you on our call. Pick a new time that works for you and we will be there.",
        ),
        CampaignType::PostCall => (
            "Thanks for your time, {{display_name}}",
            "Hi {{display_name}},\n\nThanks for speaking with us about {{account_name}}. Here is a recap and what comes next.",
        ),
        CampaignType::Onboarding => (
            "Welcome aboard, {{display_name}}",
            "Hi {{display_name}},\n\nWelcome! Here is how to get {{account_name}} set up in a few minutes.",
        ),
    };
    EmailTemplate::new(format!("{}_fallback", campaign.as_str()), subject, body)
}
