//! Outbound channels: email templates, email delivery and chat alerts.

pub mod email;
pub mod notify;
pub mod templates;

pub use email::{EmailMessage, EmailProvider, RecordingEmailProvider, SendGridProvider};
pub use notify::{Alert, ChatNotifier, NoopNotifier, RecordingNotifier, SlackNotifier};
pub use templates::{
    EmailTemplate, FallbackCatalog, RenderedContent, TemplateLibrary, TemplateSource, TemplateVars,
};
