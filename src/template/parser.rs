//! テンプレート解析
//!
//! `$NAME$` 形式のマーカーを含む生テキストを `TemplateDefinition` へ変換する。
//! `$$` はリテラルの `$` を表す。位置はすべて文字単位。

use super::definition::{is_structural_name, SegmentDef, TemplateDefinition, Variable, SELECTION};
use crate::error::{parse::Result, ParseError};

/// 字句要素
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Variable { name: String, position: usize },
}

fn is_name_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_'
}

fn tokenize(raw: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = raw.chars().collect();
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut pos = 0;

    while pos < chars.len() {
        let ch = chars[pos];
        if ch != '$' {
            literal.push(ch);
            pos += 1;
            continue;
        }

        let open = pos;
        let mut cursor = pos + 1;
        while cursor < chars.len() && is_name_char(chars[cursor]) {
            cursor += 1;
        }

        match chars.get(cursor) {
            Some('$') if cursor == open + 1 => {
                literal.push('$');
                pos = cursor + 1;
            }
            Some('$') => {
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                tokens.push(Token::Variable {
                    name: chars[open + 1..cursor].iter().collect(),
                    position: open,
                });
                pos = cursor + 1;
            }
            Some(other) => {
                return Err(ParseError::Malformed {
                    position: open,
                    reason: format!("unexpected '{}' inside variable marker", other),
                });
            }
            None => {
                return Err(ParseError::Malformed {
                    position: open,
                    reason: "unterminated variable marker".to_string(),
                });
            }
        }
    }

    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    Ok(tokens)
}

/// 生テキストと変数宣言からテンプレート定義を作る
///
/// `SELECTION` は宣言がなくても式を持たない変数として暗黙に追加される。
/// `END` `SELECTION_START` `SELECTION_END` は変数を持たない構造マーカー。
pub fn parse(raw: &str, variables: Vec<Variable>) -> Result<TemplateDefinition> {
    let mut variables = variables;
    let mut literal_text = String::with_capacity(raw.len());
    let mut literal_len = 0;
    let mut segments = Vec::new();

    for token in tokenize(raw)? {
        match token {
            Token::Literal(text) => {
                literal_len += text.chars().count();
                literal_text.push_str(&text);
            }
            Token::Variable { name, position } => {
                let declared = variables.iter().any(|v| v.name == name);
                if !declared && !is_structural_name(&name) {
                    if name == SELECTION {
                        variables.push(Variable::passive(SELECTION));
                    } else {
                        return Err(ParseError::UndeclaredVariable { name, position });
                    }
                }
                segments.push(SegmentDef {
                    name,
                    offset: literal_len,
                });
            }
        }
    }

    log::trace!(
        "parsed template: {} segments, {} variables",
        segments.len(),
        variables.len()
    );
    Ok(TemplateDefinition::from_parts(literal_text, segments, variables))
}
