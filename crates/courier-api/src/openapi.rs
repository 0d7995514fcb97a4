//! OpenAPI documentation
//!
//! Serves the OpenAPI 3.0 document and a Swagger UI page for the Courier API.

use axum::{
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};

/// Create OpenAPI routes
pub fn create_openapi_routes() -> Router {
    Router::new()
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
}

async fn openapi_json() -> impl IntoResponse {
    Json(get_openapi_spec())
}

async fn swagger_ui() -> impl IntoResponse {
    Html(SWAGGER_UI_HTML)
}

fn json_body(schema: Value) -> Value {
    json!({ "application/json": { "schema": schema } })
}

fn schema_ref(name: &str) -> Value {
    json!({ "$ref": format!("#/components/schemas/{}", name) })
}

fn secured(tag: &str, summary: &str, operation_id: &str, responses: Value) -> Value {
    json!({
        "tags": [tag],
        "summary": summary,
        "operationId": operation_id,
        "security": [{"api_key": []}, {"bearer": []}],
        "responses": responses
    })
}

/// The OpenAPI specification as JSON
pub fn get_openapi_spec() -> Value {
    let envelope_201 = json!({
        "201": {
            "description": "Attempted; `success` carries the delivery outcome",
            "content": json_body(schema_ref("SendEnvelope"))
        },
        "400": {"description": "Invalid request", "content": json_body(schema_ref("ErrorResponse"))},
        "422": {"description": "Unknown template", "content": json_body(schema_ref("ErrorResponse"))}
    });

    let mut send = secured("email", "Send one templated email", "sendEmail", envelope_201.clone());
    send["requestBody"] = json!({"required": true, "content": json_body(schema_ref("EmailMessage"))});

    let mut bulk = secured("email", "Send a template to many recipients", "sendBulk", envelope_201);
    bulk["requestBody"] = json!({"required": true, "content": json_body(schema_ref("BulkEmailRequest"))});

    let mut preview = secured(
        "email",
        "Render a template without sending",
        "previewEmail",
        json!({"200": {"description": "Rendered HTML and text"}, "422": {"description": "Unknown template"}}),
    );
    preview["requestBody"] = json!({
        "required": true,
        "content": json_body(json!({
            "type": "object",
            "required": ["template"],
            "properties": {"template": {"type": "string"}, "data": {"type": "object"}}
        }))
    });

    let mut retry = secured(
        "email",
        "Run one retry sweep",
        "retryFailed",
        json!({"200": {"description": "Sweep summary", "content": json_body(schema_ref("RetrySummary"))}}),
    );
    retry["parameters"] = json!([
        {"name": "limit", "in": "query", "schema": {"type": "integer"}},
        {"name": "max_retries", "in": "query", "schema": {"type": "integer"}}
    ]);

    let mut logs = secured(
        "email",
        "Query the email log",
        "listLogs",
        json!({"200": {"description": "Paginated log entries"}}),
    );
    logs["parameters"] = json!([
        {"name": "status", "in": "query", "schema": {"type": "string", "enum": ["pending", "sent", "delivered", "failed", "bounced"]}},
        {"name": "template", "in": "query", "schema": {"type": "string"}},
        {"name": "user_id", "in": "query", "schema": {"type": "string"}},
        {"name": "page", "in": "query", "schema": {"type": "integer", "default": 1}},
        {"name": "limit", "in": "query", "schema": {"type": "integer", "default": 20}}
    ]);

    let mut stats = secured(
        "stats",
        "Aggregate send statistics",
        "emailStats",
        json!({"200": {"description": "Totals by status, template, day and user"}}),
    );
    stats["parameters"] = json!([{"name": "days", "in": "query", "schema": {"type": "integer"}}]);

    let mut put_prefs = secured(
        "preferences",
        "Update the caller's preferences",
        "updatePreferences",
        json!({"200": {"description": "Updated preferences", "content": json_body(schema_ref("EmailPreference"))}}),
    );
    put_prefs["requestBody"] = json!({"required": true, "content": json_body(schema_ref("PreferenceUpdate"))});

    let mut post_prefs = secured(
        "preferences",
        "Create preferences for a user",
        "createPreferences",
        json!({
            "201": {"description": "Created", "content": json_body(schema_ref("EmailPreference"))},
            "409": {"description": "Preferences already exist"}
        }),
    );
    post_prefs["requestBody"] = json!({"required": true, "content": json_body(schema_ref("PreferenceUpdate"))});

    json!({
        "openapi": "3.0.3",
        "info": {
            "title": "Courier API",
            "description": "Transactional email delivery\n\n## Authentication\n\nAll endpoints except health, metrics and unsubscribe require an API key.\n\n- **Header**: `X-API-Key: <your-api-key>`\n- **Bearer**: `Authorization: Bearer <your-api-key>`",
            "version": env!("CARGO_PKG_VERSION"),
            "license": {
                "name": "Apache-2.0",
                "url": "https://www.apache.org/licenses/LICENSE-2.0"
            }
        },
        "tags": [
            {"name": "health", "description": "Health checks"},
            {"name": "email", "description": "Sending, previews, retries and logs"},
            {"name": "preferences", "description": "Recipient preferences and unsubscribe"},
            {"name": "stats", "description": "Statistics and provider dashboards"}
        ],
        "paths": {
            "/health": {
                "get": {
                    "tags": ["health"],
                    "summary": "Liveness check",
                    "operationId": "health",
                    "responses": {"200": {"description": "Service is alive", "content": json_body(schema_ref("HealthResponse"))}}
                }
            },
            "/health/ready": {
                "get": {
                    "tags": ["health"],
                    "summary": "Readiness probe",
                    "operationId": "readiness",
                    "responses": {
                        "200": {"description": "Service is ready"},
                        "503": {"description": "Database unreachable or no provider available"}
                    }
                }
            },
            "/metrics": {
                "get": {
                    "tags": ["health"],
                    "summary": "Prometheus metrics",
                    "operationId": "metrics",
                    "responses": {"200": {"description": "Text exposition format"}}
                }
            },
            "/email/send": {"post": send},
            "/email/bulk": {"post": bulk},
            "/email/preview": {"post": preview},
            "/email/retry-failed": {"post": retry},
            "/email/templates": {
                "get": secured("email", "List known templates", "listTemplates",
                    json!({"200": {"description": "Template names, categories and default subjects"}}))
            },
            "/email/logs": {"get": logs},
            "/email/stats": {"get": stats},
            "/email/stats/providers": {
                "get": secured("stats", "Per-provider quota and health", "providerStats",
                    json!({"200": {"description": "Provider stats"}}))
            },
            "/email/stats/usage": {
                "get": secured("stats", "Today's usage and remaining capacity", "usage",
                    json!({"200": {"description": "Daily counter with per-provider usage"}}))
            },
            "/email/stats/health": {
                "get": secured("stats", "Provider health", "providerHealth",
                    json!({"200": {"description": "Health snapshot"}}))
            },
            "/email/stats/reset-counters": {
                "post": secured("stats", "Reset today's counters", "resetCounters",
                    json!({"200": {"description": "Zeroed counter"}}))
            },
            "/email/stats/refresh-health": {
                "post": secured("stats", "Re-initialize providers", "refreshHealth",
                    json!({"200": {"description": "Health snapshot"}}))
            },
            "/email/preferences": {
                "get": secured("preferences", "The caller's preferences", "getPreferences",
                    json!({"200": {"description": "Preferences", "content": json_body(schema_ref("EmailPreference"))}})),
                "put": put_prefs,
                "post": post_prefs
            },
            "/email/unsubscribe": {
                "post": {
                    "tags": ["preferences"],
                    "summary": "Unsubscribe with a token",
                    "operationId": "unsubscribe",
                    "requestBody": {
                        "required": true,
                        "content": json_body(json!({
                            "type": "object",
                            "required": ["token"],
                            "properties": {
                                "token": {"type": "string"},
                                "categories": {"type": "array", "items": {"type": "string"}}
                            }
                        }))
                    },
                    "responses": {
                        "200": {"description": "Unsubscribed"},
                        "404": {"description": "Unknown token"}
                    }
                }
            },
            "/email/unsubscribe/{token}": {
                "get": {
                    "tags": ["preferences"],
                    "summary": "One-click global unsubscribe",
                    "operationId": "unsubscribeLink",
                    "parameters": [
                        {"name": "token", "in": "path", "required": true, "schema": {"type": "string"}}
                    ],
                    "responses": {
                        "200": {"description": "HTML confirmation"},
                        "404": {"description": "Unknown token"}
                    }
                }
            }
        },
        "components": {
            "securitySchemes": {
                "api_key": {
                    "type": "apiKey",
                    "in": "header",
                    "name": "X-API-Key"
                },
                "bearer": {
                    "type": "http",
                    "scheme": "bearer"
                }
            },
            "schemas": {
                "HealthResponse": {
                    "type": "object",
                    "properties": {
                        "status": {"type": "string", "example": "healthy"}
                    }
                },
                "ErrorResponse": {
                    "type": "object",
                    "properties": {
                        "error": {"type": "string", "example": "VALIDATION_ERROR"},
                        "message": {"type": "string"}
                    }
                },
                "EmailMessage": {
                    "type": "object",
                    "required": ["to", "subject", "template"],
                    "properties": {
                        "to": {"oneOf": [{"type": "string"}, {"type": "array", "items": {"type": "string"}}]},
                        "subject": {"type": "string"},
                        "template": {"type": "string", "example": "welcome"},
                        "data": {"type": "object"},
                        "from": {"type": "string", "example": "Courier <noreply@example.com>"},
                        "reply_to": {"type": "string"},
                        "cc": {"type": "array", "items": {"type": "string"}},
                        "bcc": {"type": "array", "items": {"type": "string"}},
                        "attachments": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "required": ["filename", "content"],
                                "properties": {
                                    "filename": {"type": "string"},
                                    "content": {"type": "string", "format": "byte"},
                                    "content_type": {"type": "string"}
                                }
                            }
                        },
                        "user_id": {"type": "string"}
                    }
                },
                "BulkEmailRequest": {
                    "type": "object",
                    "required": ["recipients", "subject", "template"],
                    "properties": {
                        "recipients": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "required": ["email"],
                                "properties": {
                                    "email": {"type": "string"},
                                    "data": {"type": "object"},
                                    "user_id": {"type": "string"}
                                }
                            }
                        },
                        "subject": {"type": "string"},
                        "template": {"type": "string"},
                        "data": {"type": "object"},
                        "from": {"type": "string"},
                        "reply_to": {"type": "string"}
                    }
                },
                "EmailResult": {
                    "type": "object",
                    "properties": {
                        "success": {"type": "boolean"},
                        "message_id": {"type": "string"},
                        "error": {"type": "string"},
                        "provider": {"type": "string", "enum": ["resend", "mailjet"]},
                        "blocked": {"type": "boolean"},
                        "log_id": {"type": "string", "format": "uuid"}
                    }
                },
                "SendEnvelope": {
                    "type": "object",
                    "properties": {
                        "success": {"type": "boolean"},
                        "data": {"type": "object"},
                        "error": {"type": "string"}
                    }
                },
                "RetrySummary": {
                    "type": "object",
                    "properties": {
                        "processed": {"type": "integer"},
                        "succeeded": {"type": "integer"},
                        "failed": {"type": "integer"},
                        "skipped": {"type": "integer"},
                        "skipped_run": {"type": "boolean"}
                    }
                },
                "PreferenceUpdate": {
                    "type": "object",
                    "properties": {
                        "user_id": {"type": "string"},
                        "email": {"type": "string"},
                        "order_updates": {"type": "boolean"},
                        "subscription_notifications": {"type": "boolean"},
                        "marketing_emails": {"type": "boolean"},
                        "security_alerts": {"type": "boolean"},
                        "partner_notifications": {"type": "boolean"},
                        "payment_notifications": {"type": "boolean"},
                        "system_notifications": {"type": "boolean"},
                        "global_unsubscribe": {"type": "boolean"}
                    }
                },
                "EmailPreference": {
                    "type": "object",
                    "properties": {
                        "id": {"type": "string", "format": "uuid"},
                        "user_id": {"type": "string"},
                        "email": {"type": "string"},
                        "order_updates": {"type": "boolean"},
                        "subscription_notifications": {"type": "boolean"},
                        "marketing_emails": {"type": "boolean"},
                        "security_alerts": {"type": "boolean"},
                        "partner_notifications": {"type": "boolean"},
                        "payment_notifications": {"type": "boolean"},
                        "system_notifications": {"type": "boolean"},
                        "global_unsubscribe": {"type": "boolean"},
                        "unsubscribed_categories": {"type": "array", "items": {"type": "string"}},
                        "unsubscribe_token": {"type": "string"},
                        "created_at": {"type": "string", "format": "date-time"},
                        "updated_at": {"type": "string", "format": "date-time"}
                    }
                }
            }
        }
    })
}

const SWAGGER_UI_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Courier API Documentation</title>
    <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5.9.0/swagger-ui.css" />
    <style>
        body { margin: 0; padding: 0; }
        .swagger-ui .topbar { display: none; }
    </style>
</head>
<body>
    <div id="swagger-ui"></div>
    <script src="https://unpkg.com/swagger-ui-dist@5.9.0/swagger-ui-bundle.js"></script>
    <script>
        window.onload = function() {
            SwaggerUIBundle({
                url: "/openapi.json",
                dom_id: '#swagger-ui',
                deepLinking: true,
                presets: [
                    SwaggerUIBundle.presets.apis,
                    SwaggerUIBundle.SwaggerUIStandalonePreset
                ],
                layout: "StandaloneLayout"
            });
        };
    </script>
</body>
</html>"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_lists_every_email_route() {
        let spec = get_openapi_spec();
        let paths = spec["paths"].as_object().unwrap();
        for path in [
            "/email/send",
            "/email/bulk",
            "/email/preview",
            "/email/retry-failed",
            "/email/templates",
            "/email/stats",
            "/email/logs",
            "/email/preferences",
            "/email/unsubscribe",
            "/email/unsubscribe/{token}",
            "/email/stats/providers",
            "/email/stats/usage",
            "/email/stats/health",
            "/email/stats/reset-counters",
            "/email/stats/refresh-health",
        ] {
            assert!(paths.contains_key(path), "missing {}", path);
        }
        assert!(spec["paths"]["/email/send"]["post"]["requestBody"].is_object());
    }
}
