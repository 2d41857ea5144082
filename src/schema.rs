//! 题型内容 Schema 注册表
//!
//! 无状态的纯映射：题型 → 内容对象的 JSON Schema 片段。
//! 同一份 schema 既用于约束模型输出（response_format），也用于解析后校验。
//! 没有可变状态，可以在并发调用方之间共享。

use serde_json::{json, Value};

use crate::models::question::QuestionType;

/// 获取指定题型内容对象的 JSON Schema
pub fn content_schema(question_type: QuestionType) -> Value {
    match question_type {
        QuestionType::TrueFalse => json!({
            "type": "object",
            "properties": {
                "answer": { "type": "boolean" }
            },
            "required": ["answer"],
            "additionalProperties": false
        }),
        QuestionType::MultipleChoice => json!({
            "type": "object",
            "properties": {
                "options": {
                    "type": "array",
                    // 单选题固定 4 个选项
                    "minItems": 4,
                    "maxItems": 4,
                    "items": {
                        "type": "object",
                        "properties": {
                            "text": { "type": "string" },
                            "correct": { "type": "boolean" }
                        },
                        "required": ["text", "correct"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["options"],
            "additionalProperties": false
        }),
        QuestionType::Open => json!({
            "type": "object",
            "properties": {
                "answer": { "type": "string", "minLength": 1 }
            },
            "required": ["answer"],
            "additionalProperties": false
        }),
        QuestionType::FillGap => json!({
            "type": "object",
            "properties": {
                // text 中以 {1}、{2} 形式引用空位
                "text": { "type": "string", "minLength": 1 },
                "gaps": {
                    "type": "array",
                    "minItems": 1,
                    "maxItems": 10,
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "integer", "minimum": 1 },
                            "answer": { "type": "string" }
                        },
                        "required": ["id", "answer"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["text", "gaps"],
            "additionalProperties": false
        }),
        QuestionType::Ordering => json!({
            "type": "object",
            "properties": {
                "items": {
                    "type": "array",
                    "minItems": 2,
                    "maxItems": 8,
                    "items": {
                        "type": "object",
                        "properties": {
                            "text": { "type": "string" },
                            "position": { "type": "integer", "minimum": 1 }
                        },
                        "required": ["text", "position"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["items"],
            "additionalProperties": false
        }),
        QuestionType::Matching => json!({
            "type": "object",
            "properties": {
                "left": {
                    "type": "array",
                    "minItems": 2,
                    "maxItems": 8,
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "integer" },
                            "text": { "type": "string" }
                        },
                        "required": ["id", "text"],
                        "additionalProperties": false
                    }
                },
                "right": {
                    "type": "array",
                    "minItems": 2,
                    "maxItems": 8,
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "integer" },
                            "text": { "type": "string" },
                            "matches": { "type": "integer" }
                        },
                        "required": ["id", "text", "matches"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["left", "right"],
            "additionalProperties": false
        }),
        QuestionType::Hotspot => json!({
            "type": "object",
            "properties": {
                "imageUrl": { "type": "string" },
                "regions": {
                    "type": "array",
                    "minItems": 2,
                    "maxItems": 6,
                    "items": {
                        "type": "object",
                        "properties": {
                            "x": { "type": "number" },
                            "y": { "type": "number" },
                            "width": { "type": "number" },
                            "height": { "type": "number" },
                            "correct": { "type": "boolean" }
                        },
                        "required": ["x", "y", "width", "height", "correct"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["imageUrl", "regions"],
            "additionalProperties": false
        }),
        QuestionType::Compliance => json!({
            "type": "object",
            "properties": {
                "statements": {
                    "type": "array",
                    "minItems": 2,
                    "maxItems": 10,
                    "items": {
                        "type": "object",
                        "properties": {
                            "text": { "type": "string" },
                            "compliant": { "type": "boolean" }
                        },
                        "required": ["text", "compliant"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["statements"],
            "additionalProperties": false
        }),
    }
}

/// 题目信封的 Schema：`{ "questions": [ { questionText, type, difficulty, content, ... } ] }`
///
/// 用于约束一次生成调用的整体输出结构。
pub fn questions_payload_schema(question_type: QuestionType) -> Value {
    json!({
        "type": "object",
        "properties": {
            "questions": {
                "type": "array",
                "items": question_envelope_schema(question_type)
            }
        },
        "required": ["questions"],
        "additionalProperties": false
    })
}

/// 单道题目的通用信封 Schema
pub fn question_envelope_schema(question_type: QuestionType) -> Value {
    json!({
        "type": "object",
        "properties": {
            "questionText": { "type": "string", "minLength": 1 },
            "type": { "type": "string" },
            "difficulty": { "type": "string", "enum": ["EASY", "MEDIUM", "HARD"] },
            "content": content_schema(question_type),
            "hint": { "type": "string" },
            "explanation": { "type": "string" }
        },
        "required": ["questionText", "type", "difficulty", "content"],
        "additionalProperties": false
    })
}

/// 覆盖全部题型的复合 Schema（校验工具使用）
pub fn composite_envelope_schema() -> Value {
    let variants: Vec<Value> = QuestionType::all()
        .iter()
        .map(|t| question_envelope_schema(*t))
        .collect();
    json!({
        "type": "object",
        "properties": {
            "questions": {
                "type": "array",
                "items": { "oneOf": variants }
            }
        },
        "required": ["questions"]
    })
}
