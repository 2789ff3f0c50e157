// Direct-injection automation: a single page-world script sets the code
// through the editor widget's own API and clicks submit. No waiting, no retry.

use serde_json::Value;
use tracing::{info, warn};

use super::page::PageContext;
use super::AutomationOutcome;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionSelectors {
    /// Container of the CodeMirror 5 widget.
    pub editor: String,
    pub submit: String,
}

impl Default for InjectionSelectors {
    fn default() -> Self {
        Self {
            editor: ".CodeMirror".into(),
            submit: "button.btn-submit".into(),
        }
    }
}

/// Build the self-contained script. Strings are embedded as JSON literals,
/// which are valid JavaScript string literals whatever the code contains.
pub fn build_script(selectors: &InjectionSelectors, code: &str) -> String {
    let editor = Value::from(selectors.editor.as_str()).to_string();
    let submit = Value::from(selectors.submit.as_str()).to_string();
    let code = Value::from(code).to_string();

    format!(
        r#"(function () {{
  const containers = document.querySelectorAll({editor});
  if (!containers.length) return 'no-editor';
  const container = containers[0];
  const cm = container.CodeMirror || (container.nextSibling && container.nextSibling.CodeMirror);
  if (!cm) return 'no-api';
  cm.setValue('');
  cm.setValue({code});
  const submit = document.querySelector({submit});
  if (!submit) return 'no-submit';
  submit.click();
  return 'submitted';
}})()"#
    )
}

pub async fn run<P>(page: &P, selectors: &InjectionSelectors, code: &str) -> AutomationOutcome
where
    P: PageContext + ?Sized,
{
    let script = build_script(selectors, code);
    let result = match page.run_script(&script).await {
        Ok(value) => value,
        Err(e) => {
            warn!("Injected script failed: {e}");
            return AutomationOutcome::Abandoned(e.to_string());
        }
    };

    match result.as_str() {
        Some("submitted") => {
            info!("Inserted code via editor API and clicked submit");
            AutomationOutcome::Submitted
        }
        Some("no-editor") => {
            warn!("No editor instance found");
            AutomationOutcome::Abandoned("no editor instance found".into())
        }
        Some("no-api") => {
            warn!("Editor API not found");
            AutomationOutcome::Abandoned("editor API not found".into())
        }
        Some("no-submit") => {
            warn!("Submit button not found");
            AutomationOutcome::Abandoned("submit button not found".into())
        }
        _ => {
            warn!("Unexpected script result: {result}");
            AutomationOutcome::Abandoned(format!("unexpected script result {result}"))
        }
    }
}
