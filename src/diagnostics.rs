/// One line of encoder inspect output, with the lines nested under it.
///
/// The encoder indents its inspect output in two-space steps to express
/// a hierarchy; a line containing `": "` is usually a key/value pair.
#[derive(Clone, Debug, Default)]
pub struct Node {
    pub line: String,
    pub key: String,
    pub value: String,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(line: &str) -> Self {
        let (key, value) = match line.split_once(": ") {
            Some((key, value)) => (String::from(key), String::from(value)),
            None => (String::new(), String::new()),
        };
        Node {
            line: String::from(line),
            key,
            value,
            children: vec![],
        }
    }

    /// Depth-first search for the first node whose line starts with `key`.
    pub fn get_by_key(&self, key: &str) -> Option<&Node> {
        if !self.line.is_empty() && self.line.starts_with(key) {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.get_by_key(key))
    }
}

fn indent_of(line: &str) -> (usize, &str) {
    let stripped = line.trim_start();
    (line.len() - stripped.len(), stripped.trim_end())
}

/// Builds a tree from indentation-prefixed text.
///
/// Returns a synthetic root node whose children are the top-level lines.
pub fn parse_output(output: &str) -> Node {
    let mut stack = vec![Node::new("")];
    let mut indent_level = 0;

    for raw in output.lines() {
        if raw.trim().is_empty() {
            continue;
        }

        let (indent, line) = indent_of(raw);
        let node = Node::new(line);

        if indent > indent_level {
            // the last-added line becomes the parent of this one
            match last_mut(&mut stack).children.pop() {
                Some(parent) => stack.push(parent),
                None => {} // indented line with nothing to nest under
            }
            indent_level = indent;
        } else if indent < indent_level {
            // two-space steps; never pop the root
            let mut steps = (indent_level - indent) / 2;
            while steps > 0 && stack.len() > 1 {
                let done = stack.pop().unwrap_or_default();
                last_mut(&mut stack).children.push(done);
                steps -= 1;
            }
            indent_level = indent;
        }

        last_mut(&mut stack).children.push(node);
    }

    while stack.len() > 1 {
        let done = stack.pop().unwrap_or_default();
        last_mut(&mut stack).children.push(done);
    }

    stack.pop().unwrap_or_default()
}

fn last_mut(stack: &mut Vec<Node>) -> &mut Node {
    let last = stack.len() - 1;
    &mut stack[last]
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Input #0, matroska,webm, from 'clip.webm':
  Metadata:
    title           : Dissolve

  Duration: 00:00:00.43, start: 0.000000, bitrate: 1006 kb/s
    Stream #0:0(eng): Video: vp8, yuv420p, 1920x912, 25 fps
    Stream #0:1(eng): Audio: vorbis, 44100 Hz, stereo
At least one output file must be specified";

    #[test]
    fn test_tree_shape() {
        let root = parse_output(SAMPLE);
        assert_eq!(root.children.len(), 2);
        let input0 = &root.children[0];
        assert_eq!(input0.children.len(), 2);
        assert_eq!(input0.children[0].line, "Metadata:");
        assert_eq!(input0.children[0].children.len(), 1);
        assert_eq!(input0.children[1].children.len(), 2);
    }

    #[test]
    fn test_get_by_key() {
        let root = parse_output(SAMPLE);
        let duration = root.get_by_key("Duration:").unwrap();
        assert!(duration.line.starts_with("Duration: 00:00:00.43"));
        let title = root.get_by_key("title").unwrap();
        assert_eq!(title.line, "title           : Dissolve");
        assert!(root.get_by_key("Output #0").is_none());
    }

    #[test]
    fn test_key_value_split() {
        let node = Node::new("Duration: 00:00:05.00, start: 0.000000");
        assert_eq!(node.key, "Duration");
        assert_eq!(node.value, "00:00:05.00, start: 0.000000");
        let bare = Node::new("At least one output file must be specified");
        assert_eq!(bare.key, "");
    }

    #[test]
    fn test_dedent_never_pops_root() {
        // dedent asks for more levels than exist
        let text = "      deep\nshallow";
        let root = parse_output(text);
        assert_eq!(root.children.len(), 2);
    }

    #[test]
    fn test_first_match_wins() {
        let text = "a: 1\n  b: 2\na: 3";
        let root = parse_output(text);
        assert_eq!(root.get_by_key("a").unwrap().value, "1");
        assert_eq!(root.get_by_key("b").unwrap().value, "2");
    }
}
