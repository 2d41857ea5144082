use serde::{Deserialize, Serialize};

/// 题型枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuestionType {
    /// 判断题
    TrueFalse,
    /// 单选题
    MultipleChoice,
    /// 开放题
    Open,
    /// 填空题
    FillGap,
    /// 排序题
    Ordering,
    /// 连线题
    Matching,
    /// 热区题
    Hotspot,
    /// 合规判断题（多陈述）
    Compliance,
}

/// 模型返回的题型字符串别名表
///
/// 模型输出的类型拼写并不稳定（大小写、缩写各异），统一在这里收口。
static TYPE_ALIASES: phf::Map<&'static str, QuestionType> = phf::phf_map! {
    "true_false" => QuestionType::TrueFalse,
    "truefalse" => QuestionType::TrueFalse,
    "tf" => QuestionType::TrueFalse,
    "multiple_choice" => QuestionType::MultipleChoice,
    "multiplechoice" => QuestionType::MultipleChoice,
    "mcq" => QuestionType::MultipleChoice,
    "choice" => QuestionType::MultipleChoice,
    "open" => QuestionType::Open,
    "open_ended" => QuestionType::Open,
    "short_answer" => QuestionType::Open,
    "fill_gap" => QuestionType::FillGap,
    "fill_in_the_gap" => QuestionType::FillGap,
    "fill_in_the_blank" => QuestionType::FillGap,
    "gap_fill" => QuestionType::FillGap,
    "ordering" => QuestionType::Ordering,
    "order" => QuestionType::Ordering,
    "sequence" => QuestionType::Ordering,
    "matching" => QuestionType::Matching,
    "match" => QuestionType::Matching,
    "hotspot" => QuestionType::Hotspot,
    "image_hotspot" => QuestionType::Hotspot,
    "compliance" => QuestionType::Compliance,
    "statements" => QuestionType::Compliance,
};

impl QuestionType {
    /// 获取标准名称（与 schema/序列化一致）
    pub fn name(self) -> &'static str {
        match self {
            QuestionType::TrueFalse => "TRUE_FALSE",
            QuestionType::MultipleChoice => "MULTIPLE_CHOICE",
            QuestionType::Open => "OPEN",
            QuestionType::FillGap => "FILL_GAP",
            QuestionType::Ordering => "ORDERING",
            QuestionType::Matching => "MATCHING",
            QuestionType::Hotspot => "HOTSPOT",
            QuestionType::Compliance => "COMPLIANCE",
        }
    }

    /// 尝试从字符串解析题型（容忍大小写和常见别名）
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        TYPE_ALIASES.get(normalized.as_str()).copied()
    }

    /// 回退链中可替换的、schema 兼容的替代题型
    ///
    /// 只选择同一段文本即可支撑其内容负载的题型，
    /// 不选择需要额外素材（如图片）的题型。
    pub fn fallback_alternative(self) -> Option<Self> {
        match self {
            QuestionType::TrueFalse => Some(QuestionType::Compliance),
            QuestionType::Compliance => Some(QuestionType::TrueFalse),
            QuestionType::MultipleChoice => Some(QuestionType::Open),
            QuestionType::Open => Some(QuestionType::MultipleChoice),
            QuestionType::FillGap => Some(QuestionType::Open),
            QuestionType::Ordering => Some(QuestionType::Matching),
            QuestionType::Matching => Some(QuestionType::Ordering),
            // 热区题依赖图片素材，替换为纯文本题型
            QuestionType::Hotspot => Some(QuestionType::MultipleChoice),
        }
    }

    /// 全部题型
    pub fn all() -> &'static [QuestionType] {
        &[
            QuestionType::TrueFalse,
            QuestionType::MultipleChoice,
            QuestionType::Open,
            QuestionType::FillGap,
            QuestionType::Ordering,
            QuestionType::Matching,
            QuestionType::Hotspot,
            QuestionType::Compliance,
        ]
    }
}

/// 难度枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    /// 获取标准名称
    pub fn name(self) -> &'static str {
        match self {
            Difficulty::Easy => "EASY",
            Difficulty::Medium => "MEDIUM",
            Difficulty::Hard => "HARD",
        }
    }

    /// 尝试从字符串解析难度
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "EASY" => Some(Difficulty::Easy),
            "MEDIUM" => Some(Difficulty::Medium),
            "HARD" => Some(Difficulty::Hard),
            _ => None,
        }
    }

    /// 降一档难度（回退链第一步使用；EASY 保持不变）
    pub fn easier(self) -> Self {
        match self {
            Difficulty::Hard => Difficulty::Medium,
            Difficulty::Medium => Difficulty::Easy,
            Difficulty::Easy => Difficulty::Easy,
        }
    }
}

/// 一条已解析并通过校验的题目记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionRecord {
    /// 题干
    pub question_text: String,
    /// 题型（以模型实际返回的类型为准）
    pub question_type: QuestionType,
    /// 难度
    pub difficulty: Difficulty,
    /// 按题型定义的内容负载（结构由 schema 模块约束）
    pub content: serde_json::Value,
    /// 提示（可选）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// 答案解析（可选）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    /// 来源文档块索引
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
}
