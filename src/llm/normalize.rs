//! 模型输出归一化
//!
//! 不同厂商返回的 content 形态不同（字符串 / 内容块数组 / 嵌套对象），统一递归归一化为纯文本：
//! 字符串 -> 自身；带 text 字段的对象 -> text；带 content 字段的对象 -> 递归 content；数组 -> 各部分拼接。

use serde_json::Value;

/// 递归归一化为纯文本
pub fn normalize_output(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) => items.iter().map(normalize_output).collect(),
        Value::Object(map) => {
            if let Some(Value::String(text)) = map.get("text") {
                text.clone()
            } else if let Some(content) = map.get("content") {
                normalize_output(content)
            } else {
                value.to_string()
            }
        }
        other => other.to_string(),
    }
}

/// 从文本中抽取 JSON 片段（```json ... ``` 或首个 `{` 到末个 `}`）
pub fn extract_json_block(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&trimmed[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_string() {
        assert_eq!(normalize_output(&json!("plain")), "plain");
    }

    #[test]
    fn test_normalize_blocks() {
        let v = json!([
            {"type": "text", "text": "The answer "},
            {"type": "text", "text": "is 30"}
        ]);
        assert_eq!(normalize_output(&v), "The answer is 30");
    }

    #[test]
    fn test_normalize_nested_content() {
        let v = json!({"content": [{"text": "a"}, {"content": "b"}, "c"]});
        assert_eq!(normalize_output(&v), "abc");
    }

    #[test]
    fn test_normalize_unknown_shape_falls_back_to_json() {
        let v = json!({"kind": 1});
        assert_eq!(normalize_output(&v), "{\"kind\":1}");
        assert_eq!(normalize_output(&json!(42)), "42");
    }

    #[test]
    fn test_extract_json_block() {
        assert_eq!(extract_json_block("x {\"a\":1} y"), Some("{\"a\":1}"));
        assert_eq!(extract_json_block("```json\n{\"b\":2}\n```"), Some("{\"b\":2}"));
        assert_eq!(extract_json_block("nothing here"), None);
    }
}
