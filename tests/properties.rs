//! Property based tests for marker tracking, segment overlap repair,
//! batched segment writes during recalculation and template parsing.

use altre_template::buffer::TextBuffer;
use altre_template::template::{
    expression, parse, ExpansionSession, SegmentTable, SessionState, TemplateDefinition, Variable,
};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Edit {
    Insert { position: usize, text: String },
    Delete { position: usize, len: usize },
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        (any::<usize>(), "[a-z ]{1,6}").prop_map(|(position, text)| Edit::Insert { position, text }),
        (any::<usize>(), 1usize..5).prop_map(|(position, len)| Edit::Delete { position, len }),
    ]
}

/// Sorted, non-overlapping `(start, end)` ranges inside a buffer of the returned length.
fn disjoint_ranges() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
    prop::collection::vec((0usize..4, 0usize..4), 1..6).prop_map(|parts| {
        let mut ranges = Vec::with_capacity(parts.len());
        let mut cursor = 0;
        for (gap, width) in parts {
            let start = cursor + gap;
            ranges.push((start, start + width));
            cursor = start + width + 1;
        }
        (cursor, ranges)
    })
}

fn declared_names() -> Vec<&'static str> {
    vec!["A", "B", "NAME"]
}

fn template_piece() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z(){};\n ]{1,5}",
        Just("$$".to_string()),
        prop::sample::select(vec!["$A$", "$B$", "$NAME$", "$END$", "$SELECTION$"])
            .prop_map(str::to_string),
    ]
}

#[derive(Debug, Clone)]
enum Piece {
    Literal(String),
    Mirror,
    Constant(usize),
}

fn piece_strategy() -> impl Strategy<Value = Piece> {
    prop_oneof![
        "[a-z ]{0,3}".prop_map(Piece::Literal),
        Just(Piece::Mirror),
        (0usize..3).prop_map(Piece::Constant),
    ]
}

/// `$X$` followed by the pieces; `X` is free text, `C0`..`C2` are constants
fn mirrored_template(pieces: &[Piece], constants: &[String]) -> TemplateDefinition {
    let mut raw = String::from("$X$");
    for piece in pieces {
        match piece {
            Piece::Literal(text) => raw.push_str(text),
            Piece::Mirror => raw.push_str("$X$"),
            Piece::Constant(index) => raw.push_str(&format!("$C{}$", index)),
        }
    }
    let mut variables = vec![Variable::new("X")];
    for (index, value) in constants.iter().enumerate() {
        variables.push(
            Variable::new(format!("C{}", index))
                .with_expression(expression::constant(value.clone()))
                .always_stop_at(false),
        );
    }
    parse(&raw, variables).unwrap()
}

fn segment_value(name: &str, typed: &str, constants: &[String]) -> String {
    match name.strip_prefix('C').and_then(|index| index.parse::<usize>().ok()) {
        Some(index) => constants[index].clone(),
        None => typed.to_string(),
    }
}

/// The literal text with every segment value written in, last segment first.
fn written_back_to_front(template: &TemplateDefinition, typed: &str, constants: &[String]) -> String {
    let mut buffer = TextBuffer::from_str(template.literal_text());
    for segment in template.segments().iter().rev() {
        buffer
            .insert(segment.offset, &segment_value(&segment.name, typed, constants))
            .unwrap();
    }
    buffer.text()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        .. ProptestConfig::default()
    })]

    #[test]
    fn markers_keep_their_text_under_edits_elsewhere(
        (len, ranges) in disjoint_ranges(),
        edits in prop::collection::vec(edit_strategy(), 1..24),
    ) {
        let initial: String = (0..len).map(|i| (b'a' + (i % 26) as u8) as char).collect();
        let mut buffer = TextBuffer::from_str(&initial);
        let markers: Vec<_> = ranges
            .iter()
            .map(|&(start, end)| buffer.create_range_marker(start, end).unwrap())
            .collect();
        let mut expected: Vec<String> = ranges
            .iter()
            .map(|&(start, end)| buffer.slice(start, end).unwrap())
            .collect();

        for edit in edits {
            let before: Vec<(usize, usize)> = markers
                .iter()
                .map(|&marker| buffer.marker_range(marker).unwrap())
                .collect();
            let len = buffer.len_chars();
            // Inserts touch a marker at its boundaries too; deletes only when they overlap it.
            let (from, to, inserted) = match edit {
                Edit::Insert { position, text } => {
                    let position = position % (len + 1);
                    buffer.insert(position, &text).unwrap();
                    (position, position, true)
                }
                Edit::Delete { position, len: count } => {
                    if len == 0 {
                        continue;
                    }
                    let from = position % len;
                    let to = (from + count).min(len);
                    buffer.delete(from, to).unwrap();
                    (from, to, false)
                }
            };
            let touches = |start: usize, end: usize| {
                if inserted {
                    start <= from && from <= end
                } else {
                    from < end && to > start
                }
            };

            for (index, &marker) in markers.iter().enumerate() {
                let (start, end) = buffer.marker_range(marker).unwrap();
                prop_assert!(start <= end && end <= buffer.len_chars());
                let text = buffer.slice(start, end).unwrap();
                let (old_start, old_end) = before[index];
                if !touches(old_start, old_end) {
                    prop_assert_eq!(&text, &expected[index]);
                }
                expected[index] = text;
            }
        }
    }

    #[test]
    fn overlap_repair_clears_the_current_segment(
        (len, ranges) in disjoint_ranges(),
        current in any::<prop::sample::Index>(),
        grown in (any::<usize>(), any::<usize>()),
    ) {
        let mut buffer = TextBuffer::from_str(&"x".repeat(len));
        let mut table = SegmentTable::new();
        for &(start, end) in &ranges {
            table.add_segment(&mut buffer, start, end).unwrap();
        }
        let current = current.index(ranges.len());
        let (a, b) = (grown.0 % (len + 1), grown.1 % (len + 1));
        let (new_start, new_end) = (a.min(b), a.max(b));

        table.replace_segment_at(&mut buffer, current, new_start, new_end, true).unwrap();
        table.fix_overlapped_segments(&mut buffer, current).unwrap();

        prop_assert_eq!(table.range(&buffer, current).unwrap(), (new_start, new_end));
        for index in 0..ranges.len() {
            let (start, end) = table.range(&buffer, index).unwrap();
            prop_assert!(start <= end);
            if index > current {
                prop_assert!(!(new_start <= start && start < new_end));
            } else if index < current {
                prop_assert!(!(new_start < end && end <= new_end));
            }
        }
    }

    #[test]
    fn batched_segment_writes_match_back_to_front_application(
        pieces in prop::collection::vec(piece_strategy(), 1..10),
        constants in prop::collection::vec("[a-z]{1,3}", 3),
        typed in "[A-Z]{1,4}",
    ) {
        let template = mirrored_template(&pieces, &constants);
        let mut buffer = TextBuffer::new();
        let mut session = ExpansionSession::new(template.clone());

        session.start(&mut buffer).unwrap();
        prop_assert_eq!(session.state(), SessionState::AtVariable(0));
        prop_assert_eq!(buffer.text(), written_back_to_front(&template, "", &constants));

        let (_, end) = session.current_variable_range(&buffer).unwrap();
        buffer.insert(end, &typed).unwrap();
        session.after_change(&mut buffer).unwrap();
        prop_assert_eq!(session.state(), SessionState::AtVariable(0));
        prop_assert_eq!(buffer.text(), written_back_to_front(&template, &typed, &constants));
        for (index, segment) in template.segments().iter().enumerate() {
            let (start, end) = session.segment_range(&buffer, index).unwrap();
            prop_assert_eq!(
                buffer.slice(start, end).unwrap(),
                segment_value(&segment.name, &typed, &constants)
            );
        }
    }

    #[test]
    fn serialized_template_parses_back_to_itself(
        pieces in prop::collection::vec(template_piece(), 0..12),
    ) {
        let raw: String = pieces.concat();
        let variables = declared_names().into_iter().map(Variable::new).collect();
        let template = parse(&raw, variables).unwrap();

        let reparsed = parse(&template.serialize(), template.variables().to_vec()).unwrap();
        prop_assert_eq!(reparsed.literal_text(), template.literal_text());
        prop_assert_eq!(reparsed.segments(), template.segments());
        prop_assert_eq!(reparsed.variables(), template.variables());
    }
}
