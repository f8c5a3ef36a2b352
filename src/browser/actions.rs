use serde::{Deserialize, Serialize};

/// Scripted interaction performed on the page before the capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Scroll down by `how_much` pixels, on the window or a given element
    ScrollDown {
        how_much: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        element_query_selector: Option<String>,
    },

    ScrollUp {
        how_much: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        element_query_selector: Option<String>,
    },

    ScrollToTop,

    /// Click at an absolute position on the page
    ClickAt { click_x: i64, click_y: i64 },

    /// Click the first element matching, in order of precedence, the id, the
    /// class or the query selector
    ClickElement {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        element_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        element_class: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        element_query_selector: Option<String>,
    },
}

impl Action {
    /// Check the action can be compiled into a script
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Action::ClickElement {
                element_id: None,
                element_class: None,
                element_query_selector: None,
            } => Err("click_element must define at least one predicate".to_string()),
            _ => Ok(()),
        }
    }

    /// JavaScript snippet performing this action
    pub fn to_javascript(&self) -> String {
        match self {
            Action::ScrollDown { how_much, element_query_selector } => {
                scroll_script(*how_much, element_query_selector.as_deref())
            }
            Action::ScrollUp { how_much, element_query_selector } => {
                scroll_script(-*how_much, element_query_selector.as_deref())
            }
            Action::ScrollToTop => "window.scrollTo(0, 0);".to_string(),
            Action::ClickAt { click_x, click_y } => {
                format!("document.elementFromPoint({}, {}).click();", click_x, click_y)
            }
            Action::ClickElement { element_id, element_class, element_query_selector } => {
                if let Some(id) = element_id {
                    format!("document.getElementById({}).click();", js_string(id))
                } else if let Some(class) = element_class {
                    format!("document.getElementsByClassName({})[0].click();", js_string(class))
                } else {
                    let selector = element_query_selector.as_deref().unwrap_or("body");
                    format!("document.querySelector({}).click();", js_string(selector))
                }
            }
        }
    }
}

fn scroll_script(delta: i64, selector: Option<&str>) -> String {
    match selector {
        Some(selector) => format!("document.querySelector({}).scrollBy(0, {});", js_string(selector), delta),
        None => format!("window.scrollBy(0, {});", delta),
    }
}

/// Quote a value as a JavaScript string literal
fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}
