use serde::{Deserialize, Serialize};

/// 场景ID
pub type ScenarioId = u32;

/// 追问场景ID的偏移量：`追问ID = 偏移量 × 追问序号 + 父ID`
///
/// 题库ID必须小于该值，不同原始题目的追问ID因此不会重复（1.b = 2001，2.a = 1002）。
pub const FOLLOW_UP_ID_OFFSET: ScenarioId = 1000;

/// 情境判断场景
///
/// 展示后不可修改；追问通过 [`Scenario::derive_follow_up`] 生成新的场景实例。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: ScenarioId,
    pub situation: String,
    pub question: String,
    #[serde(default)]
    pub best_response_rationale: String,
    #[serde(default)]
    pub worst_response_rationale: String,
    /// 旧数据使用 `competency` 字段，只在反序列化时兼容
    #[serde(alias = "competency")]
    pub assessed_competency: String,
    /// 追问场景的原始题目ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ScenarioId>,
}

impl Scenario {
    /// 基于当前场景生成追问场景
    ///
    /// # 参数
    /// - `ordinal`: 追问序号（从 1 开始）
    /// - `question`: 追问题干
    pub fn derive_follow_up(&self, ordinal: u32, question: String) -> Scenario {
        let root = self.root_id();
        Scenario {
            id: FOLLOW_UP_ID_OFFSET
                .saturating_mul(ordinal)
                .saturating_add(root),
            situation: self.situation.clone(),
            question,
            best_response_rationale: self.best_response_rationale.clone(),
            worst_response_rationale: self.worst_response_rationale.clone(),
            assessed_competency: self.assessed_competency.clone(),
            parent_id: Some(root),
        }
    }

    /// 原始题目ID（追问返回父ID）
    pub fn root_id(&self) -> ScenarioId {
        self.parent_id.unwrap_or(self.id)
    }

    pub fn is_follow_up(&self) -> bool {
        self.parent_id.is_some()
    }
}

/// 候选人提交的媒体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MediaRef {
    /// 内联的 data URL（`data:<mime>;base64,<payload>`）
    Inline {
        #[serde(rename = "dataUrl")]
        data_url: String,
    },
    /// 已上传到对象存储
    Stored {
        url: String,
        #[serde(rename = "contentType")]
        content_type: String,
        #[serde(rename = "sizeBytes")]
        size_bytes: usize,
    },
}

impl MediaRef {
    /// 内联表示的字节数（已上传的媒体返回 0）
    pub fn inline_len(&self) -> usize {
        match self {
            MediaRef::Inline { data_url } => data_url.len(),
            MediaRef::Stored { .. } => 0,
        }
    }
}

/// 对话中的一条问答
///
/// 顺序与界面上的题目顺序一致；追问只会插入，不会删除。
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConversationEntry {
    /// 场景ID；旧数据可能缺失，此时只能通过文本匹配找回场景
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<ScenarioId>,
    /// 追问所属的原始场景ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_scenario_id: Option<ScenarioId>,
    pub question: String,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRef>,
    #[serde(default)]
    pub situation: String,
    #[serde(default)]
    pub best_response_rationale: String,
    #[serde(default)]
    pub worst_response_rationale: String,
    #[serde(default, alias = "competency")]
    pub assessed_competency: String,
}

impl ConversationEntry {
    /// 从场景创建一条尚未作答的问答
    pub fn from_scenario(scenario: &Scenario) -> Self {
        Self {
            scenario_id: Some(scenario.id),
            parent_scenario_id: scenario.parent_id,
            question: scenario.question.clone(),
            answer: None,
            media: None,
            situation: scenario.situation.clone(),
            best_response_rationale: scenario.best_response_rationale.clone(),
            worst_response_rationale: scenario.worst_response_rationale.clone(),
            assessed_competency: scenario.assessed_competency.clone(),
        }
    }

    /// 是否已经提交了非空回答
    pub fn is_answered(&self) -> bool {
        self.answer
            .as_deref()
            .map(|a| !a.trim().is_empty())
            .unwrap_or(false)
    }

    /// 所属原始场景ID
    pub fn root_scenario_id(&self) -> Option<ScenarioId> {
        self.parent_scenario_id.or(self.scenario_id)
    }

    pub fn is_follow_up(&self) -> bool {
        self.parent_scenario_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario() -> Scenario {
        Scenario {
            id: 7,
            situation: "A customer is upset about a late delivery.".to_string(),
            question: "How do you respond?".to_string(),
            best_response_rationale: "Acknowledge and resolve".to_string(),
            worst_response_rationale: "Blame logistics".to_string(),
            assessed_competency: "Customer Focus".to_string(),
            parent_id: None,
        }
    }

    #[test]
    fn test_follow_up_ids_derive_from_root() {
        let base = scenario();
        let first = base.derive_follow_up(1, "1.a) What next?".to_string());
        assert_eq!(first.id, 1007);
        assert_eq!(first.parent_id, Some(7));
        assert_eq!(first.assessed_competency, "Customer Focus");

        // 从追问再派生时仍然挂在原始题目下
        let second = first.derive_follow_up(2, "1.b) And then?".to_string());
        assert_eq!(second.id, 2007);
        assert_eq!(second.root_id(), 7);
    }

    #[test]
    fn test_follow_up_ids_unique_across_roots() {
        let mut ids = std::collections::HashSet::new();
        for root in [1, 2, 3, 999] {
            let base = Scenario {
                id: root,
                ..scenario()
            };
            for ordinal in 1..=3 {
                let id = base.derive_follow_up(ordinal, String::new()).id;
                assert!(ids.insert(id), "追问ID重复: {}", id);
            }
        }
        assert_eq!(ids.len(), 12);
    }

    #[test]
    fn test_legacy_competency_field_alias() {
        let toml_text = r#"
            id = 3
            situation = "s"
            question = "q"
            competency = "Teamwork"
        "#;
        let scenario: Scenario = toml::from_str(toml_text).unwrap();
        assert_eq!(scenario.assessed_competency, "Teamwork");
        assert!(!scenario.is_follow_up());
    }

    #[test]
    fn test_entry_is_answered_ignores_whitespace() {
        let mut entry = ConversationEntry::from_scenario(&scenario());
        assert!(!entry.is_answered());
        entry.answer = Some("   ".to_string());
        assert!(!entry.is_answered());
        entry.answer = Some("I would apologise".to_string());
        assert!(entry.is_answered());
        assert_eq!(entry.root_scenario_id(), Some(7));
    }
}
