//! Functions the upstream service may call in the middle of a turn.
//!
//! The session treats the executor as an opaque collaborator: it advertises
//! the declarations when the bridge is created, runs whatever the upstream
//! asks for and sends the result back within the same turn.

use async_trait::async_trait;
use chrono::Utc;
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

/// A function advertised to the upstream service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait FunctionExecutor: Send + Sync {
    fn declarations(&self) -> Vec<FunctionDeclaration>;

    /// Runs `name` with `arguments`. Failures are reported inside the
    /// returned value (`{"success": false, "error": ...}`), never as a panic.
    async fn execute(&self, name: &str, arguments: &Value) -> Value;

    /// Snapshot of the executor's state for status reports.
    async fn status(&self) -> Value;
}

pub const OPEN_FORM: &str = "open_form";
pub const FILL_FIELD: &str = "fill_field";
pub const SUBMIT_FORM: &str = "submit_form";

const FORM_ID: &str = "data_entry_form";

/// Arguments of `open_form` and `submit_form`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct NoArgs {}

/// Arguments of `fill_field`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct FillFieldArgs {
    #[schemars(description = "The name of the field to fill (e.g., 'name', 'email', 'phone')")]
    #[serde(default)]
    pub field_name: String,
    #[schemars(description = "The value to put in the field")]
    #[serde(default)]
    pub value: String,
}

fn parameters_schema<T: JsonSchema>() -> Value {
    let mut schema =
        serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| json!({ "type": "object" }));
    if let Some(object) = schema.as_object_mut() {
        object.remove("$schema");
        object.remove("title");
        object
            .entry("properties")
            .or_insert_with(|| json!({}));
    }
    schema
}

#[derive(Debug, Default)]
struct FormState {
    current_form: Option<String>,
    fields: BTreeMap<String, String>,
}

/// Voice-driven data entry: open a form, fill fields, submit it.
#[derive(Debug, Default)]
pub struct FormFunctions {
    state: Mutex<FormState>,
}

impl FormFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open_form(&self) -> Value {
        let mut state = self.state.lock().await;
        state.current_form = Some(FORM_ID.to_string());
        state.fields.clear();
        info!(form_id = FORM_ID, "Form opened");
        json!({
            "success": true,
            "message": "Form has been opened and is ready for data entry",
            "form_id": FORM_ID,
        })
    }

    pub async fn fill_field(&self, field_name: &str, value: &str) -> Value {
        let mut state = self.state.lock().await;
        if state.current_form.is_none() {
            return failure("No form is currently open. Please open a form first.");
        }
        let field_name = field_name.trim().to_lowercase();
        if field_name.is_empty() || value.is_empty() {
            return failure("Field name and value cannot be empty");
        }
        state.fields.insert(field_name.clone(), value.to_string());
        info!(field = %field_name, "Form field filled");
        json!({
            "success": true,
            "message": format!("Field '{field_name}' has been filled with '{value}'"),
            "field_name": field_name,
            "value": value,
            "total_fields": state.fields.len(),
        })
    }

    pub async fn submit_form(&self) -> Value {
        let mut state = self.state.lock().await;
        let Some(form_id) = state.current_form.clone() else {
            return failure("No form is currently open");
        };
        if state.fields.is_empty() {
            return failure("Form is empty. Please fill at least one field before submitting.");
        }
        let fields = std::mem::take(&mut state.fields);
        state.current_form = None;
        info!(form_id = %form_id, field_count = fields.len(), "Form submitted");
        json!({
            "success": true,
            "message": "Form has been successfully submitted",
            "submitted_data": {
                "form_id": form_id,
                "fields": fields,
                "submitted_at": Utc::now().to_rfc3339(),
            },
            "field_count": fields.len(),
        })
    }
}

fn failure(message: &str) -> Value {
    json!({ "success": false, "error": message })
}

#[async_trait]
impl FunctionExecutor for FormFunctions {
    fn declarations(&self) -> Vec<FunctionDeclaration> {
        vec![
            FunctionDeclaration {
                name: OPEN_FORM.to_string(),
                description: "Opens a new form for data entry. Call this before filling any fields."
                    .to_string(),
                parameters: parameters_schema::<NoArgs>(),
            },
            FunctionDeclaration {
                name: FILL_FIELD.to_string(),
                description: "Fills a specific field in the currently open form with a value."
                    .to_string(),
                parameters: parameters_schema::<FillFieldArgs>(),
            },
            FunctionDeclaration {
                name: SUBMIT_FORM.to_string(),
                description: "Submits the current form after all fields have been filled."
                    .to_string(),
                parameters: parameters_schema::<NoArgs>(),
            },
        ]
    }

    async fn execute(&self, name: &str, arguments: &Value) -> Value {
        info!(function = name, args = %arguments, "Executing function");
        match name {
            OPEN_FORM => self.open_form().await,
            FILL_FIELD => match FillFieldArgs::deserialize(arguments) {
                Ok(args) => self.fill_field(&args.field_name, &args.value).await,
                Err(e) => {
                    warn!(error = %e, "Invalid fill_field arguments");
                    failure(&format!("Invalid arguments: {e}"))
                }
            },
            SUBMIT_FORM => self.submit_form().await,
            other => failure(&format!("Unknown function: {other}")),
        }
    }

    async fn status(&self) -> Value {
        let state = self.state.lock().await;
        json!({
            "is_form_open": state.current_form.is_some(),
            "current_form": state.current_form,
            "fields_filled": state.fields.len(),
            "form_fields": state.fields,
        })
    }
}
