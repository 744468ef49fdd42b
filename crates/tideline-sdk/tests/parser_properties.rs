//! 行解析器的分片与续读性质

use proptest::prelude::*;
use tideline_dataset::{FlortParser, ParseEvent, ParserState, RecordParser, ResumableParser};

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Record(f64, u64),
    Skipped(u64),
}

fn line(index: u32, noise: bool) -> String {
    if noise {
        format!("2013/01/01 00:00:{:02}.000 [flort:DLOGP6]:event {}\r\n", index % 60, index)
    } else {
        format!(
            "2013/01/01 00:{:02}:{:02}.520 01/01/13\t00:00:02\t700\t4130\t695\t700\t460\t4130\t{}\r\n",
            index / 60,
            index % 60,
            500 + index
        )
    }
}

fn parser(position: u64, mid_line: bool) -> ResumableParser {
    let inner: Box<dyn RecordParser> = Box::new(FlortParser::new().unwrap());
    ResumableParser::new(
        inner,
        ParserState {
            position,
            timestamp: None,
        },
        mid_line,
    )
}

fn drain(parser: &mut ResumableParser) -> Vec<Seen> {
    let mut out = Vec::new();
    while let Some(event) = parser.next_event() {
        out.push(match event {
            ParseEvent::Record(p, s) => Seen::Record(p.timestamp(), s.position),
            ParseEvent::Skipped(s) => Seen::Skipped(s.position),
        });
    }
    out
}

proptest! {
    /// 任意分片方式得到的事件序列与一次性读取一致
    #[test]
    fn prop_fragmentation_invariant(
        kinds in prop::collection::vec(any::<bool>(), 1..40),
        cuts in prop::collection::vec(1usize..97, 1..64),
    ) {
        let stream: String = kinds
            .iter()
            .enumerate()
            .map(|(i, noise)| line(i as u32, *noise))
            .collect();
        let bytes = stream.as_bytes();

        let mut whole = parser(0, false);
        whole.feed(bytes);
        let expected = drain(&mut whole);
        prop_assert_eq!(expected.len(), kinds.len());

        let mut pieces = parser(0, false);
        let mut actual = Vec::new();
        let mut pos = 0;
        let mut i = 0;
        while pos < bytes.len() {
            let end = (pos + cuts[i % cuts.len()]).min(bytes.len());
            pieces.feed(&bytes[pos..end]);
            actual.extend(drain(&mut pieces));
            pos = end;
            i += 1;
        }
        prop_assert_eq!(actual, expected);
    }

    /// 从任一已交付的位置续读，得到的正是剩余的事件
    #[test]
    fn prop_resume_from_any_boundary(
        kinds in prop::collection::vec(any::<bool>(), 1..30),
        split in 0usize..30,
    ) {
        let stream: String = kinds
            .iter()
            .enumerate()
            .map(|(i, noise)| line(i as u32, *noise))
            .collect();
        let bytes = stream.as_bytes();

        let mut whole = parser(0, false);
        whole.feed(bytes);
        let all = drain(&mut whole);

        let split = split.min(all.len() - 1);
        let resume_at = match all[split] {
            Seen::Record(_, pos) | Seen::Skipped(pos) => pos,
        };
        let mut resumed = parser(resume_at, false);
        resumed.feed(&bytes[resume_at as usize..]);
        prop_assert_eq!(drain(&mut resumed), all[split + 1..].to_vec());
    }
}
