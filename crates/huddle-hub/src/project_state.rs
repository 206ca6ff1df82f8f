//! Live editor and whiteboard content per project.
//!
//! Only what has been edited since the Hub started is known here; cold
//! content lives with the storage service.

use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct ProjectState {
    /// fileId → latest editor content
    editor_contents: HashMap<String, String>,
    /// shape id → shape object as last sent by a client
    whiteboard_shapes: HashMap<String, Value>,
}

impl ProjectState {
    /// `editor_update` payload: `{fileId, content}`
    pub fn apply_editor_update(&mut self, payload: &Value) {
        let Some(file_id) = payload.get("fileId").and_then(Value::as_str) else {
            return;
        };
        let content = payload
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        self.editor_contents
            .insert(file_id.to_owned(), content.to_owned());
    }

    /// `whiteboard_update` payload: `{shape: {id, ..}}`
    pub fn apply_whiteboard_update(&mut self, payload: &Value) {
        let Some(shape) = payload.get("shape") else {
            return;
        };
        if let Some(id) = shape.get("id").and_then(Value::as_str) {
            self.whiteboard_shapes.insert(id.to_owned(), shape.clone());
        }
    }

    /// `whiteboard_object_remove` payload: `{id}`
    pub fn remove_whiteboard_object(&mut self, payload: &Value) {
        if let Some(id) = payload.get("id").and_then(Value::as_str) {
            self.whiteboard_shapes.remove(id);
        }
    }

    /// `file_deleted` payload: `{fileId}`
    pub fn forget_file(&mut self, payload: &Value) {
        if let Some(file_id) = payload.get("fileId").and_then(Value::as_str) {
            self.editor_contents.remove(file_id);
        }
    }

    pub fn file_content(&self, file_id: &str) -> Option<&str> {
        self.editor_contents.get(file_id).map(String::as_str)
    }

    pub fn shape(&self, id: &str) -> Option<&Value> {
        self.whiteboard_shapes.get(id)
    }

    pub fn shape_count(&self) -> usize {
        self.whiteboard_shapes.len()
    }
}
