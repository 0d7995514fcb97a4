//! Template registry and renderer

use courier_common::types::EmailCategory;
use courier_common::{Error, Result};
use minijinja::Environment;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Known email templates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TemplateId {
    Welcome,
    PasswordReset,
    EmailVerification,
    OrderConfirmation,
    OrderStatusUpdate,
    OrderDelivered,
    PaymentSuccess,
    PaymentFailed,
    SubscriptionCreated,
    SubscriptionRenewal,
    SubscriptionCancelled,
    PartnerApplication,
    PartnerApproved,
    NewOrderPartner,
    SecurityAlert,
    ContactReply,
    Newsletter,
    Promotion,
    SystemAnnouncement,
}

impl TemplateId {
    pub const ALL: [TemplateId; 19] = [
        TemplateId::Welcome,
        TemplateId::PasswordReset,
        TemplateId::EmailVerification,
        TemplateId::OrderConfirmation,
        TemplateId::OrderStatusUpdate,
        TemplateId::OrderDelivered,
        TemplateId::PaymentSuccess,
        TemplateId::PaymentFailed,
        TemplateId::SubscriptionCreated,
        TemplateId::SubscriptionRenewal,
        TemplateId::SubscriptionCancelled,
        TemplateId::PartnerApplication,
        TemplateId::PartnerApproved,
        TemplateId::NewOrderPartner,
        TemplateId::SecurityAlert,
        TemplateId::ContactReply,
        TemplateId::Newsletter,
        TemplateId::Promotion,
        TemplateId::SystemAnnouncement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateId::Welcome => "welcome",
            TemplateId::PasswordReset => "password-reset",
            TemplateId::EmailVerification => "email-verification",
            TemplateId::OrderConfirmation => "order-confirmation",
            TemplateId::OrderStatusUpdate => "order-status-update",
            TemplateId::OrderDelivered => "order-delivered",
            TemplateId::PaymentSuccess => "payment-success",
            TemplateId::PaymentFailed => "payment-failed",
            TemplateId::SubscriptionCreated => "subscription-created",
            TemplateId::SubscriptionRenewal => "subscription-renewal",
            TemplateId::SubscriptionCancelled => "subscription-cancelled",
            TemplateId::PartnerApplication => "partner-application",
            TemplateId::PartnerApproved => "partner-approved",
            TemplateId::NewOrderPartner => "new-order-partner",
            TemplateId::SecurityAlert => "security-alert",
            TemplateId::ContactReply => "contact-reply",
            TemplateId::Newsletter => "newsletter",
            TemplateId::Promotion => "promotion",
            TemplateId::SystemAnnouncement => "system-announcement",
        }
    }

    /// Preference category gating this template; `None` is always delivered
    pub fn category(&self) -> Option<EmailCategory> {
        match self {
            TemplateId::OrderConfirmation
            | TemplateId::OrderStatusUpdate
            | TemplateId::OrderDelivered => Some(EmailCategory::OrderUpdates),
            TemplateId::PaymentSuccess | TemplateId::PaymentFailed => {
                Some(EmailCategory::PaymentNotifications)
            }
            TemplateId::SubscriptionCreated
            | TemplateId::SubscriptionRenewal
            | TemplateId::SubscriptionCancelled => Some(EmailCategory::SubscriptionNotifications),
            TemplateId::Welcome
            | TemplateId::PasswordReset
            | TemplateId::EmailVerification
            | TemplateId::SecurityAlert => Some(EmailCategory::SecurityAlerts),
            TemplateId::PartnerApplication
            | TemplateId::PartnerApproved
            | TemplateId::NewOrderPartner => Some(EmailCategory::PartnerNotifications),
            TemplateId::Newsletter | TemplateId::Promotion => Some(EmailCategory::MarketingEmails),
            TemplateId::SystemAnnouncement => Some(EmailCategory::SystemNotifications),
            TemplateId::ContactReply => None,
        }
    }

    pub fn default_subject(&self) -> &'static str {
        match self {
            TemplateId::Welcome => "Welcome aboard",
            TemplateId::PasswordReset => "Reset your password",
            TemplateId::EmailVerification => "Verify your email address",
            TemplateId::OrderConfirmation => "Your order is confirmed",
            TemplateId::OrderStatusUpdate => "Your order status changed",
            TemplateId::OrderDelivered => "Your order has been delivered",
            TemplateId::PaymentSuccess => "Payment received",
            TemplateId::PaymentFailed => "Payment failed",
            TemplateId::SubscriptionCreated => "Your subscription is active",
            TemplateId::SubscriptionRenewal => "Your subscription renews soon",
            TemplateId::SubscriptionCancelled => "Your subscription was cancelled",
            TemplateId::PartnerApplication => "We received your partner application",
            TemplateId::PartnerApproved => "Your partner application was approved",
            TemplateId::NewOrderPartner => "You have a new order",
            TemplateId::SecurityAlert => "Security alert on your account",
            TemplateId::ContactReply => "Re: your message",
            TemplateId::Newsletter => "News from our kitchen",
            TemplateId::Promotion => "A treat for you",
            TemplateId::SystemAnnouncement => "Service announcement",
        }
    }

    /// HTML content block and plain-text body
    fn sources(&self) -> (&'static str, &'static str) {
        match self {
            TemplateId::Welcome => (
                "<h1>Welcome, {{ name | default('there') }}!</h1>\
                 <p>Your account is ready. Start exploring meals near you.</p>",
                "Welcome, {{ name | default('there') }}! Your account is ready.",
            ),
            TemplateId::PasswordReset => (
                "<h1>Reset your password</h1>\
                 <p><a href=\"{{ reset_url }}\">Choose a new password</a>. \
                 The link expires in {{ expires_in | default('1 hour') }}.</p>",
                "Reset your password: {{ reset_url }}",
            ),
            TemplateId::EmailVerification => (
                "<h1>Confirm your email</h1>\
                 <p><a href=\"{{ verification_url }}\">Verify {{ email | default('your address') }}</a></p>",
                "Verify your email: {{ verification_url }}",
            ),
            TemplateId::OrderConfirmation => (
                "<h1>Order {{ order_number }} confirmed</h1>\
                 <ul>{% for item in items | default([]) %}<li>{{ item.quantity }} x {{ item.name }}</li>{% endfor %}</ul>\
                 <p>Total: {{ total }}</p>",
                "Order {{ order_number }} confirmed. Total: {{ total }}",
            ),
            TemplateId::OrderStatusUpdate => (
                "<h1>Order {{ order_number }}</h1><p>Status: <strong>{{ status }}</strong></p>",
                "Order {{ order_number }} is now {{ status }}.",
            ),
            TemplateId::OrderDelivered => (
                "<h1>Enjoy your meal!</h1><p>Order {{ order_number }} was delivered.</p>",
                "Order {{ order_number }} was delivered.",
            ),
            TemplateId::PaymentSuccess => (
                "<h1>Payment received</h1><p>We received {{ amount }} for {{ description | default('your order') }}.</p>",
                "Payment of {{ amount }} received.",
            ),
            TemplateId::PaymentFailed => (
                "<h1>Payment failed</h1><p>We could not charge {{ amount }}. {{ reason }}</p>",
                "Payment of {{ amount }} failed. {{ reason }}",
            ),
            TemplateId::SubscriptionCreated => (
                "<h1>Subscription active</h1><p>Plan: {{ plan }}. Next delivery: {{ next_delivery }}.</p>",
                "Your {{ plan }} subscription is active.",
            ),
            TemplateId::SubscriptionRenewal => (
                "<h1>Renewal reminder</h1><p>Your {{ plan }} plan renews on {{ renewal_date }}.</p>",
                "Your {{ plan }} plan renews on {{ renewal_date }}.",
            ),
            TemplateId::SubscriptionCancelled => (
                "<h1>Subscription cancelled</h1><p>Your {{ plan }} plan ends on {{ end_date }}.</p>",
                "Your {{ plan }} plan ends on {{ end_date }}.",
            ),
            TemplateId::PartnerApplication => (
                "<h1>Thanks, {{ business_name }}</h1><p>We are reviewing your application.</p>",
                "We are reviewing the application for {{ business_name }}.",
            ),
            TemplateId::PartnerApproved => (
                "<h1>Welcome, {{ business_name }}</h1><p>Your partner account is approved.</p>",
                "{{ business_name }} is approved as a partner.",
            ),
            TemplateId::NewOrderPartner => (
                "<h1>New order {{ order_number }}</h1><p>Customer: {{ customer_name }}. Total: {{ total }}.</p>",
                "New order {{ order_number }} from {{ customer_name }}.",
            ),
            TemplateId::SecurityAlert => (
                "<h1>Security alert</h1><p>{{ event }} at {{ occurred_at }}{% if ip %} from {{ ip }}{% endif %}.</p>",
                "Security alert: {{ event }} at {{ occurred_at }}.",
            ),
            TemplateId::ContactReply => (
                "<h1>Hello {{ name | default('there') }}</h1><p>{{ message }}</p>",
                "{{ message }}",
            ),
            TemplateId::Newsletter => (
                "<h1>{{ headline }}</h1><div>{{ content }}</div>",
                "{{ headline }}\n\n{{ content }}",
            ),
            TemplateId::Promotion => (
                "<h1>{{ title }}</h1><p>Use code <strong>{{ code }}</strong>{% if expires %} before {{ expires }}{% endif %}.</p>",
                "{{ title }}: use code {{ code }}.",
            ),
            TemplateId::SystemAnnouncement => (
                "<h1>{{ title }}</h1><p>{{ message }}</p>",
                "{{ title }}: {{ message }}",
            ),
        }
    }
}

impl std::fmt::Display for TemplateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TemplateId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TemplateId::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Template(format!("Unknown template: {}", s)))
    }
}

/// Rendered email body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedEmail {
    pub html: String,
    pub text: Option<String>,
}

/// Produces email bodies from a template and data
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: TemplateId, data: &Value) -> Result<RenderedEmail>;
}

const LAYOUT: &str = r#"<!DOCTYPE html>
<html>
<body style="font-family: sans-serif; max-width: 600px; margin: 0 auto;">
{% block content %}{% endblock %}
{% if unsubscribe_url %}<p style="font-size: 12px; color: #888;"><a href="{{ unsubscribe_url }}">Unsubscribe</a></p>{% endif %}
</body>
</html>"#;

const TEXT_FOOTER: &str = "{% if unsubscribe_url %}\n\nUnsubscribe: {{ unsubscribe_url }}{% endif %}";

/// MiniJinja-backed renderer with every registry template compiled up front
pub struct MiniJinjaRenderer {
    env: Environment<'static>,
}

impl MiniJinjaRenderer {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("layout.html", LAYOUT)
            .map_err(|e| Error::Template(format!("layout.html: {}", e)))?;

        for id in TemplateId::ALL {
            let (html, text) = id.sources();
            let html = format!(
                "{{% extends \"layout.html\" %}}{{% block content %}}{}{{% endblock %}}",
                html
            );
            let text = format!("{}{}", text, TEXT_FOOTER);

            env.add_template_owned(format!("{}.html", id), html)
                .map_err(|e| Error::Template(format!("{}.html: {}", id, e)))?;
            env.add_template_owned(format!("{}.txt", id), text)
                .map_err(|e| Error::Template(format!("{}.txt: {}", id, e)))?;
        }

        Ok(Self { env })
    }

    fn render_one(&self, name: &str, data: &Value) -> Result<String> {
        self.env
            .get_template(name)
            .and_then(|t| t.render(data))
            .map_err(|e| Error::Template(format!("{}: {}", name, e)))
    }
}

impl TemplateRenderer for MiniJinjaRenderer {
    fn render(&self, template: TemplateId, data: &Value) -> Result<RenderedEmail> {
        let html = self.render_one(&format!("{}.html", template), data)?;
        let text = self.render_one(&format!("{}.txt", template), data)?;
        Ok(RenderedEmail {
            html,
            text: Some(text),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_template_names_roundtrip_and_unknown() {
        for id in TemplateId::ALL {
            assert_eq!(id.as_str().parse::<TemplateId>().unwrap(), id);
        }
        assert!(matches!(
            "invoice".parse::<TemplateId>(),
            Err(Error::Template(_))
        ));
    }

    #[test]
    fn test_category_table() {
        assert_eq!(
            TemplateId::OrderConfirmation.category(),
            Some(EmailCategory::OrderUpdates)
        );
        assert_eq!(
            TemplateId::PaymentSuccess.category(),
            Some(EmailCategory::PaymentNotifications)
        );
        assert_eq!(
            TemplateId::Welcome.category(),
            Some(EmailCategory::SecurityAlerts)
        );
        assert_eq!(
            TemplateId::Promotion.category(),
            Some(EmailCategory::MarketingEmails)
        );
        assert_eq!(TemplateId::ContactReply.category(), None);
    }

    #[test]
    fn test_every_template_compiles_and_renders() {
        let renderer = MiniJinjaRenderer::new().unwrap();
        for id in TemplateId::ALL {
            let rendered = renderer.render(id, &json!({})).unwrap();
            assert!(rendered.html.contains("<html>"), "{}", id);
            assert!(rendered.text.is_some());
        }
    }

    #[test]
    fn test_render_with_data_and_unsubscribe_link() {
        let renderer = MiniJinjaRenderer::new().unwrap();
        let rendered = renderer
            .render(
                TemplateId::OrderConfirmation,
                &json!({
                    "order_number": "A-100",
                    "total": "$12.50",
                    "items": [{"name": "Ramen", "quantity": 2}],
                    "unsubscribe_url": "https://example.com/u/tok"
                }),
            )
            .unwrap();

        assert!(rendered.html.contains("Order A-100 confirmed"));
        assert!(rendered.html.contains("2 x Ramen"));
        assert!(rendered.html.contains(">Unsubscribe</a>"));
        assert_eq!(
            rendered.text.as_deref(),
            Some("Order A-100 confirmed. Total: $12.50\n\nUnsubscribe: https://example.com/u/tok")
        );
    }

    #[test]
    fn test_no_unsubscribe_link_without_url() {
        let renderer = MiniJinjaRenderer::new().unwrap();
        let rendered = renderer
            .render(TemplateId::Welcome, &json!({"name": "Ada"}))
            .unwrap();
        assert!(rendered.html.contains("Welcome, Ada!"));
        assert!(!rendered.html.contains("Unsubscribe"));
    }
}
