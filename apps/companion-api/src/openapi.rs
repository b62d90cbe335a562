use serde_json::{Value, json};

fn json_body(description: &str, schema: &str) -> Value {
    json!({
        "description": description,
        "content": {
            "application/json": {
                "schema": { "$ref": format!("#/components/schemas/{schema}") },
            },
        },
    })
}

fn request_body(schema: &str, required: bool) -> Value {
    json!({
        "required": required,
        "content": {
            "application/json": {
                "schema": { "$ref": format!("#/components/schemas/{schema}") },
            },
        },
    })
}

fn error_responses(codes: &[&str]) -> serde_json::Map<String, Value> {
    codes
        .iter()
        .map(|code| ((*code).to_owned(), json_body("Error", "Error")))
        .collect()
}

fn responses(ok: Value, errors: &[&str]) -> Value {
    let mut map = error_responses(errors);
    map.insert("200".to_owned(), ok);
    Value::Object(map)
}

pub fn openapi_spec() -> Value {
    json!({
        "openapi": "3.1.0",
        "info": {
            "title": "Student Companion API",
            "version": env!("CARGO_PKG_VERSION"),
            "description": "Emotion-aware chat with a knowledge base that grows from rated answers.",
        },
        "paths": {
            "/healthz": {
                "get": {
                    "summary": "Health check",
                    "responses": responses(json_body("Service health", "Health"), &[]),
                },
            },
            "/sessions": {
                "post": {
                    "summary": "Start a session",
                    "requestBody": request_body("CreateSessionRequest", false),
                    "responses": responses(json_body("New session", "SessionCreated"), &["500", "503"]),
                },
            },
            "/sessions/{session_id}/chat": {
                "post": {
                    "summary": "Send one message and receive the reply",
                    "parameters": [{ "$ref": "#/components/parameters/SessionIdPath" }],
                    "requestBody": request_body("ChatRequest", true),
                    "responses": responses(json_body("Assistant reply", "ChatReply"), &["400", "404", "503"]),
                },
            },
            "/sessions/{session_id}/reset": {
                "post": {
                    "summary": "Replace the session with a fresh one for the same user",
                    "parameters": [{ "$ref": "#/components/parameters/SessionIdPath" }],
                    "responses": responses(json_body("New session", "SessionCreated"), &["404", "503"]),
                },
            },
            "/sessions/{session_id}/stats": {
                "get": {
                    "summary": "Session statistics",
                    "parameters": [{ "$ref": "#/components/parameters/SessionIdPath" }],
                    "responses": responses(json_body("Statistics", "SessionStatistics"), &["404", "503"]),
                },
            },
            "/sessions/{session_id}/emotion-pattern": {
                "get": {
                    "summary": "Dominant emotion of the session",
                    "parameters": [{ "$ref": "#/components/parameters/SessionIdPath" }],
                    "responses": responses(json_body("Emotion pattern", "EmotionPattern"), &["503"]),
                },
            },
            "/conversations/{conversation_id}/feedback": {
                "post": {
                    "summary": "Rate an exchange from 1 to 5",
                    "parameters": [{
                        "name": "conversation_id",
                        "in": "path",
                        "required": true,
                        "schema": { "type": "integer", "minimum": 1 },
                    }],
                    "requestBody": request_body("FeedbackRequest", true),
                    "responses": responses(json_body("Feedback recorded", "FeedbackResponse"), &["400", "404", "503"]),
                },
            },
            "/learning/trigger": {
                "post": {
                    "summary": "Re-mine rated history and flush the learning buffer",
                    "requestBody": request_body("LearnRequest", false),
                    "responses": responses(json_body("Documents learned", "LearnResponse"), &["400", "503"]),
                },
            },
            "/knowledge": {
                "get": {
                    "summary": "Knowledge store details",
                    "responses": responses(json_body("Knowledge info", "KnowledgeInfo"), &["503"]),
                },
            },
            "/openapi.json": {
                "get": {
                    "summary": "This document",
                    "responses": { "200": { "description": "OpenAPI 3.1 document" } },
                },
            },
            "/docs": {
                "get": {
                    "summary": "Interactive API reference",
                    "responses": { "200": { "description": "HTML page" } },
                },
            },
        },
        "components": {
            "parameters": {
                "SessionIdPath": {
                    "name": "session_id",
                    "in": "path",
                    "required": true,
                    "schema": { "type": "string" },
                },
            },
            "schemas": {
                "Error": {
                    "type": "object",
                    "required": ["error"],
                    "properties": { "error": { "type": "string" } },
                },
                "Health": {
                    "type": "object",
                    "required": ["status", "service"],
                    "properties": {
                        "status": { "type": "string" },
                        "service": { "type": "string" },
                    },
                },
                "CreateSessionRequest": {
                    "type": "object",
                    "properties": { "user_id": { "type": "string" } },
                },
                "SessionCreated": {
                    "type": "object",
                    "required": ["session_id"],
                    "properties": {
                        "session_id": { "type": "string" },
                        "user_id": { "type": ["string", "null"] },
                    },
                },
                "ChatRequest": {
                    "type": "object",
                    "required": ["message"],
                    "properties": { "message": { "type": "string", "minLength": 1 } },
                },
                "ChatReply": {
                    "type": "object",
                    "required": ["response", "detected_emotions", "rag_docs_count", "conversation_id", "session_id"],
                    "properties": {
                        "response": { "type": "string" },
                        "detected_emotions": { "type": "array", "items": { "type": "string" } },
                        "rag_docs_count": { "type": "integer" },
                        "conversation_id": { "type": "integer" },
                        "session_id": { "type": "string" },
                    },
                },
                "FeedbackRequest": {
                    "type": "object",
                    "required": ["score"],
                    "properties": {
                        "score": { "type": "number", "minimum": 1, "maximum": 5 },
                        "text": { "type": "string" },
                    },
                },
                "FeedbackResponse": {
                    "type": "object",
                    "required": ["success"],
                    "properties": { "success": { "type": "boolean" } },
                },
                "SessionStatistics": {
                    "type": "object",
                    "required": ["session_id", "message_count", "emotion_distribution", "start_time", "last_active_time"],
                    "properties": {
                        "session_id": { "type": "string" },
                        "message_count": { "type": "integer" },
                        "avg_feedback_score": { "type": ["number", "null"] },
                        "emotion_distribution": {
                            "type": "object",
                            "additionalProperties": { "type": "integer" },
                        },
                        "start_time": { "type": "string", "format": "date-time" },
                        "last_active_time": { "type": "string", "format": "date-time" },
                    },
                },
                "EmotionPattern": {
                    "type": "object",
                    "required": ["status"],
                    "properties": {
                        "status": { "type": "string", "enum": ["insufficient_data", "dominant"] },
                        "main_emotion": { "type": "string" },
                        "emotion_frequency": { "type": "integer" },
                        "total_messages": { "type": "integer" },
                        "avg_satisfaction": { "type": ["number", "null"] },
                    },
                },
                "LearnRequest": {
                    "type": "object",
                    "properties": { "min_score": { "type": "number", "default": 4.0 } },
                },
                "LearnResponse": {
                    "type": "object",
                    "required": ["learned"],
                    "properties": { "learned": { "type": "integer" } },
                },
                "KnowledgeInfo": {
                    "type": "object",
                    "required": ["document_count", "embedding_model", "dimension"],
                    "properties": {
                        "document_count": { "type": "integer" },
                        "embedding_model": { "type": "string" },
                        "dimension": { "type": "integer" },
                    },
                },
            },
        },
    })
}

pub fn scalar_docs_html(spec_url: &str) -> String {
    format!(
        r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>Student Companion API</title>
    <style>
      html, body, #app {{
        margin: 0;
        height: 100%;
      }}
    </style>
  </head>
  <body>
    <div id="app"></div>
    <script src="https://cdn.jsdelivr.net/npm/@scalar/api-reference"></script>
    <script>
      Scalar.createApiReference('#app', {{ url: '{spec_url}' }});
    </script>
  </body>
</html>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::{openapi_spec, scalar_docs_html};

    #[test]
    fn every_route_is_documented() {
        let spec = openapi_spec();
        assert_eq!(spec["openapi"], "3.1.0");
        for path in [
            "/healthz",
            "/sessions",
            "/sessions/{session_id}/chat",
            "/sessions/{session_id}/reset",
            "/sessions/{session_id}/stats",
            "/sessions/{session_id}/emotion-pattern",
            "/conversations/{conversation_id}/feedback",
            "/learning/trigger",
            "/knowledge",
        ] {
            assert!(spec["paths"][path].is_object(), "{path} missing");
        }
    }

    #[test]
    fn error_statuses_reference_the_error_schema() {
        let spec = openapi_spec();
        let not_found = &spec["paths"]["/sessions/{session_id}/chat"]["post"]["responses"]["404"];
        assert_eq!(
            not_found["content"]["application/json"]["schema"]["$ref"],
            "#/components/schemas/Error"
        );
    }

    #[test]
    fn docs_page_points_at_spec_url() {
        assert!(scalar_docs_html("/openapi.json").contains("url: '/openapi.json'"));
    }
}
