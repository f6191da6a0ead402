use serde::Deserialize;
use serde_json::Value;

/// Inbound WebSocket message: a payload for the module owning `widget_id`.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    #[serde(alias = "widget_id")]
    pub widget_id: String,
    #[serde(default)]
    pub message: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_both_spellings_of_widget_id() {
        let a: ClientMessage = serde_json::from_str(r#"{"widgetId":"watchlist","message":{"type":"x"}}"#).unwrap();
        let b: ClientMessage = serde_json::from_str(r#"{"widget_id":"watchlist"}"#).unwrap();
        assert_eq!(a.widget_id, b.widget_id);
        assert_eq!(a.message["type"], "x");
        assert!(b.message.is_null());
    }
}
