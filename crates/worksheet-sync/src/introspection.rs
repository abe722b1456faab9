//! Introspection (tab-completion and docstring lookup) state machine.
//!
//! A request is classified once from the text before the cursor. While a
//! completion list is showing, keys move a highlight through a column-major
//! grid of candidates; the request key toggles between the list and the
//! docstring of the highlighted candidate, which is why both the replacing
//! word and the docstring flag are kept at the same time.
//!
//! Cursor offsets are byte offsets into the cell input, clamped to the
//! nearest preceding character boundary.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use ts_rs::TS;

/// Inserted when the request key is pressed with nothing to introspect.
pub const INDENT: &str = "    ";

fn command_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"([a-zA-Z_][a-zA-Z._0-9]*)$").unwrap())
}

fn function_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"([a-zA-Z_][a-zA-Z._0-9]*)\([^()]*$").unwrap())
}

fn word_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"([a-zA-Z_][a-zA-Z._0-9]*)").unwrap())
}

/// First identifier-looking run in `s`, or `s` itself if there is none.
pub fn first_identifier(s: &str) -> &str {
    word_pattern()
        .captures(s)
        .and_then(|c| c.get(1))
        .map_or(s, |m| m.as_str())
}

/// Split `text` at `cursor`, clamping to a valid character boundary.
pub fn split_at_cursor(text: &str, cursor: usize) -> (&str, &str) {
    let mut cursor = cursor.min(text.len());
    while !text.is_char_boundary(cursor) {
        cursor -= 1;
    }
    text.split_at(cursor)
}

/// What the text before the cursor asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Documentation lookup; `query` is sent as the text before the cursor.
    Docstring { query: String },
    /// Name completion of `word`; `prefix` is the text before it.
    Completion { prefix: String, word: String },
    /// Nothing to introspect.
    Indent,
}

pub fn classify(before: &str) -> Classification {
    if before.ends_with('?') {
        return Classification::Docstring {
            query: before.to_string(),
        };
    }
    if let Some(word) = command_pattern().captures(before).and_then(|c| c.get(1)) {
        return Classification::Completion {
            prefix: before[..word.start()].to_string(),
            word: word.as_str().to_string(),
        };
    }
    if let Some(name) = function_pattern().captures(before).and_then(|c| c.get(1)) {
        return Classification::Docstring {
            query: format!("{}?", name.as_str()),
        };
    }
    Classification::Indent
}

// ============================================================================
// Completion grid
// ============================================================================

/// Candidates laid out column-major; `(row, col)` exists iff
/// `row + col * rows < len`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionGrid {
    candidates: Vec<String>,
    columns: usize,
    rows: usize,
    row: usize,
    col: usize,
}

impl CompletionGrid {
    pub fn new(candidates: Vec<String>, columns: usize) -> Self {
        let columns = columns.max(1);
        let rows = candidates.len() / columns + 1;
        Self {
            candidates,
            columns,
            rows,
            row: 0,
            col: 0,
        }
    }

    pub fn exists(&self, row: usize, col: usize) -> bool {
        row < self.rows && col < self.columns && row + col * self.rows < self.candidates.len()
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&str> {
        if self.exists(row, col) {
            Some(self.candidates[row + col * self.rows].as_str())
        } else {
            None
        }
    }

    pub fn selected(&self) -> (usize, usize) {
        (self.row, self.col)
    }

    pub fn selected_word(&self) -> Option<&str> {
        self.get(self.row, self.col)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    fn last_row(&self, col: usize) -> usize {
        (0..self.rows).rev().find(|&r| self.exists(r, col)).unwrap_or(0)
    }

    fn last_col(&self, row: usize) -> usize {
        (0..self.columns).rev().find(|&c| self.exists(row, c)).unwrap_or(0)
    }

    pub fn up(&mut self) {
        match self.row.checked_sub(1) {
            Some(row) if self.exists(row, self.col) => self.row = row,
            _ => self.row = self.last_row(self.col),
        }
    }

    pub fn down(&mut self) {
        self.row = if self.exists(self.row + 1, self.col) {
            self.row + 1
        } else {
            0
        };
    }

    pub fn right(&mut self) {
        self.col = if self.exists(self.row, self.col + 1) {
            self.col + 1
        } else {
            0
        };
    }

    pub fn left(&mut self) {
        match self.col.checked_sub(1) {
            Some(col) if self.exists(self.row, col) => self.col = col,
            _ => self.col = self.last_col(self.row),
        }
    }

    /// Row-major view for display.
    pub fn to_menu(&self) -> CompletionMenu {
        let rows = (0..self.rows)
            .map(|r| {
                (0..self.columns)
                    .filter_map(|c| self.get(r, c).map(str::to_string))
                    .collect::<Vec<_>>()
            })
            .filter(|row| !row.is_empty())
            .collect();
        CompletionMenu {
            rows,
            selected_row: self.row,
            selected_col: self.col,
        }
    }
}

/// Completion list as handed to the view layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
pub struct CompletionMenu {
    pub rows: Vec<Vec<String>>,
    pub selected_row: usize,
    pub selected_col: usize,
}

// ============================================================================
// Per-cell state
// ============================================================================

/// Keys the state machine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrospectionKey {
    Up,
    Down,
    Left,
    Right,
    /// Enter: commit the highlighted candidate.
    Pick,
    /// Escape: close without committing.
    Escape,
    /// Tab: (re)request introspection.
    Request,
    /// Any other key; a plain edit of the input.
    Other,
}

impl IntrospectionKey {
    fn is_arrow(self) -> bool {
        matches!(
            self,
            IntrospectionKey::Up
                | IntrospectionKey::Down
                | IntrospectionKey::Left
                | IntrospectionKey::Right
        )
    }
}

/// Result of starting introspection at a cursor position.
#[derive(Debug, Clone, PartialEq)]
pub enum Begin {
    /// Send `introspect` with `before` / `after`.
    Request {
        state: IntrospectionState,
        before: String,
        after: String,
    },
    /// Nothing to introspect; the input becomes `input` with the cursor at
    /// `cursor`.
    Indent { input: String, cursor: usize },
}

/// What the view should show after an introspection result arrives.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    List(CompletionMenu),
    Docstring(String),
    /// A single candidate; it was committed directly.
    Committed { input: String, cursor: usize },
    /// No result; introspection is over.
    Closed,
}

/// Reaction to a key press while introspection is active.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyOutcome {
    /// The highlight moved.
    Navigated { row: usize, col: usize, word: String },
    /// Replace the cell input; introspection is over.
    Commit { input: String, cursor: usize },
    /// Input changed since the last request; classify again from scratch.
    Restart,
    /// Send `introspect` again with these halves.
    Requery { before: String, after: String },
    /// Introspection is over and the key is consumed.
    Closed,
    /// Introspection is over and the key proceeds as a normal edit.
    Dismissed,
    /// State unchanged; the key proceeds as a normal edit.
    PassThrough,
}

/// Transient introspection state of one cell.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntrospectionState {
    before_replacing_word: String,
    after_cursor: String,
    replacing_word: String,
    replacement_word: String,
    docstring_query: String,
    replacing: bool,
    docstring: bool,
    changed: bool,
    loaded: bool,
    grid: Option<CompletionGrid>,
}

impl IntrospectionState {
    /// Classify the text before `cursor` and build the initial state.
    pub fn begin(input: &str, cursor: usize) -> Begin {
        let (before, after) = split_at_cursor(input, cursor);
        let mut state = IntrospectionState {
            before_replacing_word: before.to_string(),
            after_cursor: after.to_string(),
            ..Default::default()
        };

        let query = match classify(before) {
            Classification::Indent => {
                return Begin::Indent {
                    input: format!("{}{}{}", before, INDENT, after),
                    cursor: before.len() + INDENT.len(),
                };
            }
            Classification::Completion { prefix, word } => {
                state.replacing = true;
                state.before_replacing_word = prefix;
                state.replacing_word = word;
                before.to_string()
            }
            Classification::Docstring { query } => {
                state.docstring = true;
                state.docstring_query = query.clone();
                query
            }
        };

        Begin::Request {
            state,
            before: query,
            after: after.to_string(),
        }
    }

    pub fn is_completion_list(&self) -> bool {
        self.replacing && !self.docstring
    }

    pub fn is_docstring(&self) -> bool {
        self.docstring
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn replacing_word(&self) -> Option<&str> {
        self.replacing.then_some(self.replacing_word.as_str())
    }

    pub fn replacement_word(&self) -> &str {
        &self.replacement_word
    }

    pub fn before_replacing_word(&self) -> &str {
        &self.before_replacing_word
    }

    pub fn after_cursor(&self) -> &str {
        &self.after_cursor
    }

    pub fn grid(&self) -> Option<&CompletionGrid> {
        self.grid.as_ref()
    }

    /// Record that the input was edited since the last request.
    pub fn mark_changed(&mut self) {
        self.changed = true;
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Cursor position after the server rewrote the input to `new_input`.
    pub fn cursor_after(&self, new_input: &str) -> usize {
        new_input.len().saturating_sub(self.after_cursor.len())
    }

    /// Take in the introspection output of a finished request.
    pub fn receive(&mut self, output: &str, columns: usize) -> Received {
        if output.trim().is_empty() {
            return Received::Closed;
        }
        self.loaded = true;

        if !self.is_completion_list() {
            return Received::Docstring(output.to_string());
        }

        let candidates: Vec<String> = output.split_whitespace().map(str::to_string).collect();
        if candidates.len() == 1 {
            let (input, cursor) = self.splice(&candidates[0]);
            return Received::Committed { input, cursor };
        }

        let grid = CompletionGrid::new(candidates, columns);
        self.replacement_word = grid.selected_word().unwrap_or_default().to_string();
        let menu = grid.to_menu();
        self.grid = Some(grid);
        Received::List(menu)
    }

    pub fn handle_key(&mut self, key: IntrospectionKey) -> KeyOutcome {
        if self.is_completion_list() {
            if let Some(grid) = self.grid.as_mut() {
                let moved = match key {
                    IntrospectionKey::Up => {
                        grid.up();
                        true
                    }
                    IntrospectionKey::Down => {
                        grid.down();
                        true
                    }
                    IntrospectionKey::Left => {
                        grid.left();
                        true
                    }
                    IntrospectionKey::Right => {
                        grid.right();
                        true
                    }
                    _ => false,
                };
                if moved {
                    let (row, col) = grid.selected();
                    if let Some(word) = grid.selected_word() {
                        self.replacement_word = word.to_string();
                    }
                    return KeyOutcome::Navigated {
                        row,
                        col,
                        word: self.replacement_word.clone(),
                    };
                }
                if key == IntrospectionKey::Pick {
                    let word = self.replacement_word.clone();
                    let (input, cursor) = self.splice(&word);
                    return KeyOutcome::Commit { input, cursor };
                }
            }
        }

        match key {
            IntrospectionKey::Request => return self.request_again(),
            IntrospectionKey::Escape => return KeyOutcome::Closed,
            _ => {}
        }

        if self.is_completion_list() {
            return KeyOutcome::Dismissed;
        }
        if !key.is_arrow() {
            self.changed = true;
        }
        KeyOutcome::PassThrough
    }

    fn request_again(&mut self) -> KeyOutcome {
        if self.changed {
            self.changed = false;
            return KeyOutcome::Restart;
        }

        let before = match (self.replacing, self.docstring) {
            (false, true) => {
                toggle_source_request(&mut self.docstring_query);
                self.docstring_query.clone()
            }
            (true, false) => {
                self.docstring = true;
                format!("{}{}?", self.before_replacing_word, self.replacement_word)
            }
            (true, true) => {
                self.docstring = false;
                format!("{}{}", self.before_replacing_word, self.replacing_word)
            }
            (false, false) => return KeyOutcome::PassThrough,
        };

        self.loaded = false;
        KeyOutcome::Requery {
            before,
            after: self.after_cursor.clone(),
        }
    }

    /// Input with `word` (trimmed to its first identifier) in place of the
    /// replacing word, and the cursor right after it.
    fn splice(&self, word: &str) -> (String, usize) {
        let word = first_identifier(word);
        let input = format!("{}{}{}", self.before_replacing_word, word, self.after_cursor);
        (input, self.before_replacing_word.len() + word.len())
    }
}

/// `name?` asks for the docstring, `name??` for the source.
fn toggle_source_request(query: &mut String) {
    if query.ends_with("??") {
        query.pop();
    } else {
        query.push('?');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_of(n: usize) -> CompletionGrid {
        CompletionGrid::new((0..n).map(|i| format!("w{}", i)).collect(), 3)
    }

    fn list_state(input: &str, output: &str) -> IntrospectionState {
        let Begin::Request { mut state, .. } = IntrospectionState::begin(input, input.len()) else {
            panic!("expected an introspection request");
        };
        assert!(matches!(state.receive(output, 3), Received::List(_)));
        state
    }

    #[test]
    fn test_classify_function_call() {
        assert_eq!(
            classify("x = foo("),
            Classification::Docstring {
                query: "foo?".into()
            }
        );
        assert_eq!(
            classify("plot(sin(x), 0, "),
            Classification::Docstring {
                query: "plot?".into()
            }
        );
    }

    #[test]
    fn test_classify_completion() {
        assert_eq!(
            classify("y = foo"),
            Classification::Completion {
                prefix: "y = ".into(),
                word: "foo".into()
            }
        );
        assert_eq!(
            classify("math.sq"),
            Classification::Completion {
                prefix: "".into(),
                word: "math.sq".into()
            }
        );
    }

    #[test]
    fn test_classify_docstring_and_indent() {
        assert_eq!(
            classify("factor?"),
            Classification::Docstring {
                query: "factor?".into()
            }
        );
        assert_eq!(classify("for i in x:\n"), Classification::Indent);
        assert_eq!(classify(""), Classification::Indent);
    }

    #[test]
    fn test_begin_indent_inserts_spaces() {
        let Begin::Indent { input, cursor } = IntrospectionState::begin("if x:\nfoo", 6) else {
            panic!("expected indent");
        };
        assert_eq!(input, "if x:\n    foo");
        assert_eq!(cursor, 10);
    }

    #[test]
    fn test_begin_splits_at_char_boundary() {
        let (before, after) = split_at_cursor("é1", 1);
        assert_eq!(before, "");
        assert_eq!(after, "é1");
    }

    #[test]
    fn test_grid_layout_is_column_major() {
        let grid = grid_of(7);
        assert_eq!(grid.get(0, 0), Some("w0"));
        assert_eq!(grid.get(2, 0), Some("w2"));
        assert_eq!(grid.get(0, 1), Some("w3"));
        assert_eq!(grid.get(0, 2), Some("w6"));
        assert!(!grid.exists(1, 2));
        assert!(!grid.exists(3, 0));
    }

    #[test]
    fn test_grid_up_wraps_to_last_row_of_column() {
        let mut grid = grid_of(7);
        grid.up();
        assert_eq!(grid.selected(), (2, 0));

        grid.right();
        assert_eq!(grid.selected(), (2, 1));
        // Column 2 only has row 0.
        grid.right();
        assert_eq!(grid.selected(), (2, 0));
    }

    #[test]
    fn test_grid_left_wraps_to_last_column_of_row() {
        let mut grid = grid_of(7);
        grid.left();
        assert_eq!(grid.selected(), (0, 2));
        grid.down();
        assert_eq!(grid.selected(), (0, 2));
        grid.up();
        assert_eq!(grid.selected(), (0, 2));
    }

    #[test]
    fn test_grid_navigation_stays_in_range() {
        for n in 2..12 {
            let mut grid = grid_of(n);
            for step in 0..50 {
                match step % 4 {
                    0 => grid.up(),
                    1 => grid.left(),
                    2 => grid.down(),
                    _ => grid.right(),
                }
                let (row, col) = grid.selected();
                assert!(grid.exists(row, col), "n={} at ({}, {})", n, row, col);
            }
        }
    }

    #[test]
    fn test_grid_menu_rows() {
        let menu = grid_of(4).to_menu();
        assert_eq!(
            menu.rows,
            vec![vec!["w0".to_string(), "w2".into()], vec!["w1".into(), "w3".into()]]
        );
    }

    #[test]
    fn test_commit_highlighted_candidate() {
        let mut state = list_state("x = fa", "factor factorial fast_callable");
        let outcome = state.handle_key(IntrospectionKey::Down);
        assert_eq!(
            outcome,
            KeyOutcome::Navigated {
                row: 1,
                col: 0,
                word: "factorial".into()
            }
        );
        assert_eq!(
            state.handle_key(IntrospectionKey::Pick),
            KeyOutcome::Commit {
                input: "x = factorial".into(),
                cursor: 13
            }
        );
    }

    #[test]
    fn test_commit_keeps_text_after_cursor() {
        let Begin::Request { mut state, .. } = IntrospectionState::begin("fa + 1", 2) else {
            panic!("expected an introspection request");
        };
        state.receive("factor(n) factorial(n)", 3);
        assert_eq!(
            state.handle_key(IntrospectionKey::Pick),
            KeyOutcome::Commit {
                input: "factor + 1".into(),
                cursor: 6
            }
        );
    }

    #[test]
    fn test_single_candidate_is_inserted_directly() {
        let Begin::Request { mut state, .. } = IntrospectionState::begin("fact", 4) else {
            panic!("expected an introspection request");
        };
        assert_eq!(
            state.receive("factorial", 3),
            Received::Committed {
                input: "factorial".into(),
                cursor: 9
            }
        );
    }

    #[test]
    fn test_empty_result_closes() {
        let Begin::Request { mut state, .. } = IntrospectionState::begin("zzz", 3) else {
            panic!("expected an introspection request");
        };
        assert_eq!(state.receive("  ", 3), Received::Closed);
    }

    #[test]
    fn test_toggle_list_and_docstring() {
        let mut state = list_state("fa", "factor factorial");
        assert_eq!(
            state.handle_key(IntrospectionKey::Request),
            KeyOutcome::Requery {
                before: "factor?".into(),
                after: "".into()
            }
        );
        assert!(state.is_docstring());
        assert_eq!(state.replacing_word(), Some("fa"));

        assert_eq!(
            state.receive("<div class=\"docstring\">factor(n)</div>", 3),
            Received::Docstring("<div class=\"docstring\">factor(n)</div>".into())
        );

        assert_eq!(
            state.handle_key(IntrospectionKey::Request),
            KeyOutcome::Requery {
                before: "fa".into(),
                after: "".into()
            }
        );
        assert!(state.is_completion_list());
    }

    #[test]
    fn test_docstring_toggles_source() {
        let Begin::Request {
            mut state, before, ..
        } = IntrospectionState::begin("factor?", 7)
        else {
            panic!("expected an introspection request");
        };
        assert_eq!(before, "factor?");
        state.receive("docs", 3);

        let KeyOutcome::Requery { before, .. } = state.handle_key(IntrospectionKey::Request) else {
            panic!("expected requery");
        };
        assert_eq!(before, "factor??");
        let KeyOutcome::Requery { before, .. } = state.handle_key(IntrospectionKey::Request) else {
            panic!("expected requery");
        };
        assert_eq!(before, "factor?");
    }

    #[test]
    fn test_edit_since_request_restarts() {
        let Begin::Request { mut state, .. } = IntrospectionState::begin("foo(", 4) else {
            panic!("expected an introspection request");
        };
        state.receive("docs", 3);
        assert_eq!(state.handle_key(IntrospectionKey::Other), KeyOutcome::PassThrough);
        assert!(state.is_changed());
        assert_eq!(state.handle_key(IntrospectionKey::Request), KeyOutcome::Restart);
        assert!(!state.is_changed());
    }

    #[test]
    fn test_other_key_dismisses_list() {
        let mut state = list_state("fa", "factor factorial");
        assert_eq!(state.handle_key(IntrospectionKey::Other), KeyOutcome::Dismissed);
        let mut state = list_state("fa", "factor factorial");
        assert_eq!(state.handle_key(IntrospectionKey::Escape), KeyOutcome::Closed);
    }

    #[test]
    fn test_first_identifier() {
        assert_eq!(first_identifier("factor(n)"), "factor");
        assert_eq!(first_identifier("  x.y z"), "x.y");
        assert_eq!(first_identifier("++"), "++");
    }

    #[test]
    fn test_cursor_after_new_input() {
        let Begin::Request { state, .. } = IntrospectionState::begin("fa + 1", 2) else {
            panic!("expected an introspection request");
        };
        assert_eq!(state.cursor_after("factorial + 1"), 9);
    }
}
