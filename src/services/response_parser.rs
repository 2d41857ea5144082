//! 模型响应解析 - 业务能力层
//!
//! 解析步骤（markdown 剥离 → JSON 解析 → 信封校验 → 按题型结构校验）
//! 全部以独立函数暴露，方便逐步单测。
//!
//! 容错策略：
//! - 单个元素缺字段：警告并丢弃，不影响整次调用
//! - 类型与请求不一致：警告，但按实际类型接受
//! - 全部元素被丢弃 / 顶层结构错误：整次调用判为解析失败
//! - 截断：专门的错误类型，附带可操作的提示

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;

use crate::error::GenerationError;
use crate::models::question::{Difficulty, QuestionRecord, QuestionType};

/// 解析结果：通过的题目 + 非致命警告
#[derive(Debug, Default)]
pub struct ParsedQuestions {
    pub questions: Vec<QuestionRecord>,
    pub warnings: Vec<String>,
}

/// 剥离 markdown 代码围栏和首尾空白
///
/// 模型偶尔无视指令把 JSON 包在 ```json ... ``` 里。
pub fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut lines: Vec<&str> = trimmed.lines().collect();
    // 去掉开头的 ``` 或 ```json 行
    lines.remove(0);
    // 去掉结尾的 ``` 行（如果有）
    if let Some(last) = lines.last() {
        if last.trim() == "```" {
            lines.pop();
        }
    }
    lines.join("\n").trim().to_string()
}

/// 解析一次生成调用的完整响应
///
/// # 参数
/// - `raw`: 模型原始输出
/// - `requested_type`: 请求的题型（类型不一致时用于警告文案）
/// - `requested_difficulty`: 请求的难度（元素难度非法时的警告文案）
/// - `max_output_tokens`: 本次调用配置的输出上限（截断错误提示用）
pub fn parse_questions(
    raw: &str,
    requested_type: QuestionType,
    requested_difficulty: Difficulty,
    max_output_tokens: u32,
) -> Result<ParsedQuestions, GenerationError> {
    let cleaned = strip_code_fences(raw);

    let root: Value = match serde_json::from_str(&cleaned) {
        Ok(v) => v,
        Err(e) => {
            // 截断启发：JSON 在中途结束（数组/对象/字符串未闭合）
            if e.is_eof() {
                return Err(GenerationError::Truncated { max_output_tokens });
            }
            return Err(GenerationError::ParseFailure {
                reason: format!("malformed JSON: {}", e),
            });
        }
    };

    let questions_value = root.get("questions").ok_or_else(|| {
        GenerationError::ParseFailure {
            reason: "missing 'questions' field at top level".to_string(),
        }
    })?;

    let elements = questions_value
        .as_array()
        .ok_or_else(|| GenerationError::ParseFailure {
            reason: "'questions' must be an array".to_string(),
        })?;

    let mut parsed = ParsedQuestions::default();

    for (index, element) in elements.iter().enumerate() {
        match parse_question_element(element, requested_type, requested_difficulty) {
            Ok((record, warning)) => {
                if let Some(w) = warning {
                    parsed.warnings.push(w);
                }
                parsed.questions.push(record);
            }
            Err(ElementError::Dropped(reason)) => {
                parsed
                    .warnings
                    .push(format!("question[{}] dropped: {}", index, reason));
            }
            Err(ElementError::Fatal(e)) => return Err(e),
        }
    }

    if parsed.questions.is_empty() {
        return Err(GenerationError::ParseFailure {
            reason: "no valid questions parsed".to_string(),
        });
    }

    Ok(parsed)
}

/// 单个元素的失败形态：丢弃（警告）或整次调用失败
enum ElementError {
    Dropped(String),
    Fatal(GenerationError),
}

/// 解析单个题目元素
///
/// 返回 (记录, 可选警告)。信封缺字段 → Dropped；内容结构违规 → Fatal。
fn parse_question_element(
    element: &Value,
    requested_type: QuestionType,
    requested_difficulty: Difficulty,
) -> Result<(QuestionRecord, Option<String>), ElementError> {
    let question_text = element
        .get("questionText")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ElementError::Dropped("missing or empty questionText".to_string()))?;

    let type_str = element
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ElementError::Dropped("missing type".to_string()))?;

    let actual_type = QuestionType::parse(type_str)
        .ok_or_else(|| ElementError::Dropped(format!("unknown question type '{}'", type_str)))?;

    let difficulty_str = element
        .get("difficulty")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ElementError::Dropped("missing difficulty".to_string()))?;

    let difficulty = Difficulty::parse(difficulty_str)
        .ok_or_else(|| ElementError::Dropped(format!("unknown difficulty '{}'", difficulty_str)))?;

    let content = element
        .get("content")
        .filter(|v| v.is_object())
        .ok_or_else(|| ElementError::Dropped("missing content object".to_string()))?;

    validate_content(actual_type, content).map_err(ElementError::Fatal)?;

    // 类型不一致：警告，但按实际类型接受
    let warning = if actual_type != requested_type {
        Some(format!(
            "type mismatch: requested {}, model returned {}; accepting as {}",
            requested_type.name(),
            actual_type.name(),
            actual_type.name()
        ))
    } else if difficulty != requested_difficulty {
        Some(format!(
            "difficulty mismatch: requested {}, model returned {}",
            requested_difficulty.name(),
            difficulty.name()
        ))
    } else {
        None
    };

    let record = QuestionRecord {
        question_text: question_text.to_string(),
        question_type: actual_type,
        difficulty,
        content: content.clone(),
        hint: element
            .get("hint")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        explanation: element
            .get("explanation")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        chunk_index: None,
    };

    Ok((record, warning))
}

/// 按题型的内容结构校验（通用解析通过后执行）
///
/// 违规抛出带题型名的致命错误。
pub fn validate_content(
    question_type: QuestionType,
    content: &Value,
) -> Result<(), GenerationError> {
    let fail = |reason: String| GenerationError::ContentValidationFailed {
        question_type: question_type.name().to_string(),
        reason,
    };

    match question_type {
        QuestionType::TrueFalse => {
            if !content.get("answer").map(Value::is_boolean).unwrap_or(false) {
                return Err(fail("must have a boolean 'answer'".to_string()));
            }
        }
        QuestionType::MultipleChoice => {
            let options = content
                .get("options")
                .and_then(|v| v.as_array())
                .ok_or_else(|| fail("must have an 'options' array".to_string()))?;
            for (i, option) in options.iter().enumerate() {
                let has_text = option.get("text").map(Value::is_string).unwrap_or(false);
                let has_correct = option.get("correct").map(Value::is_boolean).unwrap_or(false);
                if !has_text || !has_correct {
                    return Err(fail(format!(
                        "option[{}] must have 'text' and boolean 'correct'",
                        i
                    )));
                }
            }
        }
        QuestionType::Open => {
            let answer = content.get("answer").and_then(|v| v.as_str());
            if answer.map(|s| s.trim().is_empty()).unwrap_or(true) {
                return Err(fail("must have a non-empty string 'answer'".to_string()));
            }
        }
        QuestionType::FillGap => validate_fill_gap(content, &fail)?,
        QuestionType::Ordering => {
            let items = content
                .get("items")
                .and_then(|v| v.as_array())
                .ok_or_else(|| fail("must have an 'items' array".to_string()))?;
            // 条目内部结构留给后续解析阶段
            if items.is_empty() {
                return Err(fail("'items' must not be empty".to_string()));
            }
        }
        QuestionType::Matching => {
            if !content.get("left").map(Value::is_array).unwrap_or(false) {
                return Err(fail("must have a 'left' array".to_string()));
            }
            if !content.get("right").map(Value::is_array).unwrap_or(false) {
                return Err(fail("must have a 'right' array".to_string()));
            }
        }
        QuestionType::Hotspot => {
            if !content.get("imageUrl").map(Value::is_string).unwrap_or(false) {
                return Err(fail("must have an 'imageUrl' string".to_string()));
            }
            if !content.get("regions").map(Value::is_array).unwrap_or(false) {
                return Err(fail("must have a 'regions' array".to_string()));
            }
        }
        QuestionType::Compliance => {
            if !content.get("statements").map(Value::is_array).unwrap_or(false) {
                return Err(fail("must have a 'statements' array".to_string()));
            }
        }
    }

    Ok(())
}

/// 填空题校验：`text` 中 `{N}` 占位符与 `gaps` 的 id 必须完全对应，
/// 且 id 必须是从 1 开始的连续整数。
fn validate_fill_gap(
    content: &Value,
    fail: &dyn Fn(String) -> GenerationError,
) -> Result<(), GenerationError> {
    let text = content
        .get("text")
        .and_then(|v| v.as_str())
        .ok_or_else(|| fail("must have a 'text' string".to_string()))?;

    let gaps = content
        .get("gaps")
        .and_then(|v| v.as_array())
        .ok_or_else(|| fail("must have a 'gaps' array".to_string()))?;

    if gaps.is_empty() {
        return Err(fail("must have at least one gap defined".to_string()));
    }

    let mut gap_ids = BTreeSet::new();
    for gap in gaps {
        let id = gap
            .get("id")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| fail("every gap must have an integer 'id'".to_string()))?;
        gap_ids.insert(id);
    }

    // id 必须是 1..=n 的连续整数
    let expected: BTreeSet<u64> = (1..=gaps.len() as u64).collect();
    if gap_ids != expected {
        return Err(fail(format!(
            "gap ids must be sequential integers starting at 1, found {:?}",
            gap_ids
        )));
    }

    let placeholder_re = Regex::new(r"\{(\d+)\}").map_err(|e| fail(e.to_string()))?;
    let mut placeholder_ids = BTreeSet::new();
    for capture in placeholder_re.captures_iter(text) {
        if let Ok(id) = capture[1].parse::<u64>() {
            placeholder_ids.insert(id);
        }
    }

    if placeholder_ids.is_empty() {
        return Err(fail("'text' must contain at least one {N} placeholder".to_string()));
    }

    for id in &placeholder_ids {
        if !gap_ids.contains(id) {
            return Err(fail(format!(
                "id={} referenced in text but missing from gaps",
                id
            )));
        }
    }
    for id in &gap_ids {
        if !placeholder_ids.contains(id) {
            return Err(fail(format!(
                "gap id={} is not referenced in text",
                id
            )));
        }
    }

    Ok(())
}
