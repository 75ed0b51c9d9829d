use std::collections::{BTreeMap, HashMap};
use std::io::Read;

use csv::ByteRecord;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::models::{ItemInfo, Subject};
use crate::table::{field, TableReader};

pub const COL_ITEM_ID: &str = "ID_ITEM";
pub const COL_DESCRIPTOR: &str = "NU_DESCRITOR_HABILIDADE";
pub const COL_SUBJECT: &str = "TP_DISCIPLINA";
pub const COL_ANSWER: &str = "TX_GABARITO";
pub const COL_POSITION: &str = "NU_POSICAO";
pub const COL_BLOCK: &str = "NU_BLOCO";

pub const BLOCKS: [u32; 2] = [1, 2];

/// Response column holding one block of one subject, e.g. `TX_RESP_BLOCO1_LP`.
pub fn response_column(subject: Subject, block: u32) -> String {
    format!("TX_RESP_BLOCO{block}_{subject}")
}

/// One row of the item metadata table.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemRow {
    pub item_id: String,
    pub descriptor: String,
    pub subject: Subject,
    pub answer: String,
    pub position: f64,
    pub block: u32,
}

/// Item rules shared by every grade.
#[derive(Debug, Clone)]
pub struct ItemFilter {
    pub descriptor: Regex,
    pub excluded_answers: Vec<String>,
}

impl ItemFilter {
    fn keeps(&self, row: &ItemRow) -> bool {
        self.descriptor.is_match(&row.descriptor)
            && !self.excluded_answers.iter().any(|marker| marker == &row.answer)
            && single_char(&row.answer).is_some()
    }
}

fn single_char(text: &str) -> Option<char> {
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(c),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemMap {
    entries: HashMap<String, BTreeMap<usize, ItemInfo>>,
}

impl ItemMap {
    pub fn get(&self, column: &str, offset: usize) -> Option<&ItemInfo> {
        self.entries.get(column)?.get(&offset)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keeps the rows the filter accepts and numbers each (subject, block)
    /// group by position, so offsets run contiguously over kept items.
    pub fn build(rows: Vec<ItemRow>, filter: &ItemFilter) -> Self {
        let mut groups: BTreeMap<(Subject, u32), Vec<ItemRow>> = BTreeMap::new();
        for row in rows {
            if !filter.keeps(&row) || !BLOCKS.contains(&row.block) {
                debug!(item = %row.item_id, descriptor = %row.descriptor, "item left out of the map");
                continue;
            }
            groups.entry((row.subject, row.block)).or_default().push(row);
        }

        let mut entries: HashMap<String, BTreeMap<usize, ItemInfo>> = HashMap::new();
        for ((subject, block), mut items) in groups {
            items.sort_by(|a, b| a.position.total_cmp(&b.position));
            let offsets = entries.entry(response_column(subject, block)).or_default();
            for (offset, item) in items.into_iter().enumerate() {
                if let Some(answer) = single_char(&item.answer) {
                    offsets.insert(
                        offset,
                        ItemInfo {
                            descriptor: item.descriptor,
                            answer,
                            subject,
                        },
                    );
                }
            }
        }
        Self { entries }
    }

    /// Reads the item table and builds the map, failing with `EmptyMapping`
    /// when nothing scorable is left.
    pub fn load<R: Read>(reader: &mut TableReader<R>, filter: &ItemFilter) -> Result<Self> {
        let rows = read_items(reader)?;
        let read = rows.len();
        let map = Self::build(rows, filter);
        if map.is_empty() {
            return Err(PipelineError::EmptyMapping {
                path: reader.path().to_path_buf(),
            });
        }
        info!(
            path = %reader.path().display(),
            rows = read,
            mapped = map.len(),
            "item map built"
        );
        Ok(map)
    }
}

/// Rows lacking an answer, a known subject, or a numeric position/block are
/// left out here; the filter handles the rest.
pub fn read_items<R: Read>(reader: &mut TableReader<R>) -> Result<Vec<ItemRow>> {
    let item_id = reader.require(COL_ITEM_ID)?;
    let descriptor = reader.require(COL_DESCRIPTOR)?;
    let subject = reader.require(COL_SUBJECT)?;
    let answer = reader.require(COL_ANSWER)?;
    let position = reader.require(COL_POSITION)?;
    let block = reader.require(COL_BLOCK)?;

    let mut rows = Vec::new();
    let mut unusable = 0usize;
    let mut record = ByteRecord::new();
    while reader.next_row(&mut record)? {
        let Some(answer) = field(&record, answer) else {
            continue;
        };
        let parsed = (
            field(&record, subject).and_then(|s| s.parse::<Subject>().ok()),
            field(&record, position).and_then(|p| p.parse::<f64>().ok()),
            field(&record, block).and_then(|b| b.parse::<f64>().ok()),
        );
        let (Some(subject), Some(position), Some(block)) = parsed else {
            unusable += 1;
            continue;
        };
        rows.push(ItemRow {
            item_id: field(&record, item_id).unwrap_or_default(),
            descriptor: field(&record, descriptor).unwrap_or_default(),
            subject,
            answer,
            position,
            block: block as u32,
        });
    }

    if unusable > 0 {
        warn!(
            path = %reader.path().display(),
            rows = unusable,
            "item rows without a known subject or numeric position/block were ignored"
        );
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> ItemFilter {
        ItemFilter {
            descriptor: Regex::new(r"^D\d+$").unwrap(),
            excluded_answers: vec!["X".into(), "E".into()],
        }
    }

    fn row(descriptor: &str, subject: Subject, answer: &str, position: f64, block: u32) -> ItemRow {
        ItemRow {
            item_id: format!("{descriptor}-{position}"),
            descriptor: descriptor.to_string(),
            subject,
            answer: answer.to_string(),
            position,
            block,
        }
    }

    #[test]
    fn offsets_follow_position_order() {
        let map = ItemMap::build(
            vec![
                row("D02", Subject::Lp, "B", 2.0, 1),
                row("D01", Subject::Lp, "A", 1.0, 1),
            ],
            &filter(),
        );
        let first = map.get("TX_RESP_BLOCO1_LP", 0).unwrap();
        assert_eq!(first.descriptor, "D01");
        assert_eq!(first.answer, 'A');
        assert_eq!(map.get("TX_RESP_BLOCO1_LP", 1).unwrap().descriptor, "D02");
        assert_eq!(map.get("TX_RESP_BLOCO1_LP", 2), None);
    }

    #[test]
    fn excluded_items_do_not_take_an_offset() {
        let map = ItemMap::build(
            vec![
                row("D01", Subject::Mt, "A", 1.0, 2),
                row("D02", Subject::Mt, "X", 2.0, 2),
                row("D03", Subject::Mt, "C", 3.0, 2),
            ],
            &filter(),
        );
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("TX_RESP_BLOCO2_MT", 1).unwrap().descriptor, "D03");
    }

    #[test]
    fn non_canonical_descriptors_are_dropped() {
        let map = ItemMap::build(
            vec![
                row("D10", Subject::Lp, "A", 1.0, 1),
                row("EF05LP01", Subject::Lp, "B", 2.0, 1),
                row("D", Subject::Lp, "C", 3.0, 1),
                row("D11", Subject::Lp, "C", 4.0, 3),
            ],
            &filter(),
        );
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("TX_RESP_BLOCO1_LP", 0).unwrap().descriptor, "D10");
    }

    #[test]
    fn subjects_and_blocks_are_separate_columns() {
        let map = ItemMap::build(
            vec![
                row("D01", Subject::Lp, "A", 1.0, 1),
                row("D01", Subject::Mt, "B", 1.0, 1),
                row("D02", Subject::Lp, "C", 1.0, 2),
            ],
            &filter(),
        );
        let mut columns: Vec<&str> = map.columns().collect();
        columns.sort();
        assert_eq!(
            columns,
            vec!["TX_RESP_BLOCO1_LP", "TX_RESP_BLOCO1_MT", "TX_RESP_BLOCO2_LP"]
        );
        assert_eq!(map.get("TX_RESP_BLOCO1_MT", 0).unwrap().subject, Subject::Mt);
    }

    #[test]
    fn load_fails_when_nothing_survives() {
        let text = "ID_ITEM;NU_DESCRITOR_HABILIDADE;TP_DISCIPLINA;TX_GABARITO;NU_POSICAO;NU_BLOCO\n\
                    1;EF05LP01;LP;A;1;1\n\
                    2;D01;LP;;2;1\n";
        let mut reader = TableReader::from_reader("TS_ITEM.csv", text.as_bytes()).unwrap();
        let err = ItemMap::load(&mut reader, &filter()).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyMapping { .. }));
    }

    #[test]
    fn load_reads_item_table() {
        let text = "ID_ITEM;NU_DESCRITOR_HABILIDADE;TP_DISCIPLINA;TX_GABARITO;NU_POSICAO;NU_BLOCO\n\
                    1;D01;LP;A;1;1\n\
                    2;D02;LP;B;2;1\n\
                    3;D05;MT;C;1;1\n";
        let mut reader = TableReader::from_reader("TS_ITEM.csv", text.as_bytes()).unwrap();
        let map = ItemMap::load(&mut reader, &filter()).unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.get("TX_RESP_BLOCO1_MT", 0).unwrap().answer, 'C');
    }
}
