//! Parsing of assembly source into an [ast::File].
//!
//! The parser keeps a single token of lookahead (the `peeked` slot) over the
//! lexer's spanned token stream and accumulates diagnostics instead of
//! stopping at the first problem; a file that produced any diagnostics fails
//! as a batch once parsing is done.

use logos::Logos;

use super::ast::{
    BinOp, DataDecl, DataItem, DataKind, Expr, File, IfBlock, Instruction, Item, MacroDef,
    MemOperand, Operand, UnOp,
};
use super::token::{LineIndex, Span, Token};
use crate::error::{Diagnostic, ParseErrors};

/// Parses a whole source file. Returns the accumulated diagnostics as an
/// error if there were any.
pub fn parse_file(source: &str) -> Result<File, ParseErrors> {
    let mut parser = Parser::new(source);
    let file = parser.parse_file();

    if parser.diagnostics.is_empty() {
        Ok(file)
    } else {
        Err(ParseErrors {
            diagnostics: parser.diagnostics,
        })
    }
}

/// Classifies an identifier as a register name.
///
/// The set covers every x86-64 general-purpose width form plus `mm0..mm7`,
/// `xmm0..xmm15` and the control/debug/instruction-pointer/flags aliases.
/// Matching is case-insensitive.
pub fn is_register(name: &str) -> bool {
    let lower = name.to_lowercase();

    matches!(
        lower.as_str(),
        "al" | "ah" | "ax" | "eax" | "rax"
            | "bl" | "bh" | "bx" | "ebx" | "rbx"
            | "cl" | "ch" | "cx" | "ecx" | "rcx"
            | "dl" | "dh" | "dx" | "edx" | "rdx"
            | "si" | "esi" | "rsi" | "di" | "edi" | "rdi"
            | "sp" | "esp" | "rsp" | "bp" | "ebp" | "rbp"
            | "spl" | "bpl" | "sil" | "dil"
            | "r8" | "r9" | "r10" | "r11" | "r12" | "r13" | "r14" | "r15"
            | "r8d" | "r9d" | "r10d" | "r11d" | "r12d" | "r13d" | "r14d" | "r15d"
            | "r8w" | "r9w" | "r10w" | "r11w" | "r12w" | "r13w" | "r14w" | "r15w"
            | "r8b" | "r9b" | "r10b" | "r11b" | "r12b" | "r13b" | "r14b" | "r15b"
            | "mm0" | "mm1" | "mm2" | "mm3" | "mm4" | "mm5" | "mm6" | "mm7"
            | "xmm0" | "xmm1" | "xmm2" | "xmm3" | "xmm4" | "xmm5" | "xmm6" | "xmm7"
            | "xmm8" | "xmm9" | "xmm10" | "xmm11" | "xmm12" | "xmm13" | "xmm14" | "xmm15"
            | "cr0" | "cr2" | "cr3" | "cr4"
            | "dr0" | "dr1" | "dr2" | "dr3" | "dr6" | "dr7"
            | "rip" | "eip" | "ip" | "flags" | "rflags" | "eflags"
    )
}

/// Interprets a number literal: `0x`/`0X` prefix or `h`/`H` suffix for hex,
/// `0b`/`0B` prefix or `b`/`B` suffix for binary, `o`/`O` suffix for octal,
/// optional leading sign, decimal otherwise.
pub fn parse_number(text: &str) -> Result<i64, std::num::ParseIntError> {
    let mut s = text.trim();

    let mut neg = false;
    if let Some(rest) = s.strip_prefix('+') {
        s = rest;
    } else if let Some(rest) = s.strip_prefix('-') {
        s = rest;
        neg = true;
    }

    let n = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16)?
    } else if let Some(hex) = s.strip_suffix('h').or_else(|| s.strip_suffix('H')) {
        i64::from_str_radix(hex, 16)?
    } else if let Some(bin) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        i64::from_str_radix(bin, 2)?
    } else if let Some(bin) = s.strip_suffix('b').or_else(|| s.strip_suffix('B')) {
        i64::from_str_radix(bin, 2)?
    } else if let Some(oct) = s.strip_suffix('o').or_else(|| s.strip_suffix('O')) {
        i64::from_str_radix(oct, 8)?
    } else {
        s.parse::<i64>()?
    };

    Ok(if neg { n.wrapping_neg() } else { n })
}

/// What ended a `parse_items` run inside a `%`-block.
#[derive(Debug, PartialEq)]
enum BlockEnd {
    Eof,
    Terminator(String),
}

pub struct Parser<'a> {
    tokens: logos::SpannedIter<'a, Token<'a>>,
    peeked: Option<(Token<'a>, Span)>,
    lines: LineIndex,
    end: usize,
    pub diagnostics: Vec<Diagnostic>,
}

impl<'a> Parser<'a> {
    pub fn new(source: &'a str) -> Parser<'a> {
        Parser {
            tokens: Token::lexer(source).spanned(),
            peeked: None,
            lines: LineIndex::new(source),
            end: source.len(),
            diagnostics: Vec::new(),
        }
    }

    fn next(&mut self) -> Option<(Token<'a>, Span)> {
        if let Some(t) = self.peeked.take() {
            return Some(t);
        }
        self.tokens.next()
    }

    fn backup(&mut self, token: (Token<'a>, Span)) {
        debug_assert!(self.peeked.is_none());
        self.peeked = Some(token);
    }

    fn line_col(&self, span: &Span) -> (usize, usize) {
        self.lines.line_col(span.start)
    }

    fn diag(&mut self, span: &Span, message: String) {
        let (line, col) = self.line_col(span);
        self.diagnostics.push(Diagnostic { line, col, message });
    }

    pub fn parse_file(&mut self) -> File {
        let (items, _) = self.parse_items(&[]);
        File { items }
    }

    /// Parses statements until end of input, or until a `%`-terminator from
    /// `terminators` (lowercased) is seen at statement position.
    fn parse_items(&mut self, terminators: &[&str]) -> (Vec<Item>, BlockEnd) {
        let mut items = Vec::new();

        loop {
            let (tok, span) = match self.next() {
                Some(t) => t,
                None => return (items, BlockEnd::Eof),
            };

            match tok {
                Token::Newline => continue,

                Token::Ident(name) => {
                    match self.next() {
                        Some((Token::Colon, _)) => {
                            let (line, col) = self.line_col(&span);
                            items.push(Item::Label {
                                name: name.to_string(),
                                line,
                                col,
                            });
                            self.consume_line();
                            continue;
                        }
                        Some(other) => self.backup(other),
                        None => {}
                    }

                    items.push(self.statement(name, &span));
                }

                Token::Percent => {
                    let (name, name_span) = match self.next() {
                        Some((Token::Ident(n), s)) => (n.to_string(), s),
                        Some((other, s)) => {
                            self.diag(
                                &s,
                                format!("expected identifier after '%' but got {}", other),
                            );
                            (other.literal(), s)
                        }
                        None => {
                            self.diag(&span, "expected identifier after '%'".to_string());
                            return (items, BlockEnd::Eof);
                        }
                    };

                    let lower = name.to_lowercase();

                    if terminators.contains(&lower.as_str()) {
                        self.consume_line();
                        return (items, BlockEnd::Terminator(lower));
                    }

                    items.push(self.percent_statement(&lower, &name, &span, &name_span));
                }

                // Anything else at statement position is skipped through the
                // end of the line.
                _ => self.consume_line(),
            }
        }
    }

    /// A statement whose first token is the identifier `first`.
    fn statement(&mut self, first: &str, span: &Span) -> Item {
        let (line, col) = self.line_col(span);

        if first.starts_with('.') {
            let args = self.rest_of_line();
            return Item::Directive {
                name: first.to_string(),
                args,
                line,
                col,
            };
        }

        let lower = first.to_lowercase();

        match lower.as_str() {
            "section" | "global" | "extern" | "bits" | "org" | "align" => {
                let args = self.rest_of_line();
                Item::Directive {
                    name: lower,
                    args,
                    line,
                    col,
                }
            }
            _ => {
                if let Some(kind) = DataKind::from_keyword(&lower) {
                    let items = self.parse_data_items();
                    return Item::Data(DataDecl {
                        kind,
                        items,
                        line,
                        col,
                    });
                }

                let operands = self.parse_operands();
                Item::Instruction(Instruction {
                    mnemonic: first.to_string(),
                    operands,
                    line,
                    col,
                })
            }
        }
    }

    /// A statement opened by `%`: a macro block, a conditional block, or a
    /// generic `%name` directive.
    fn percent_statement(
        &mut self,
        lower: &str,
        name: &str,
        percent_span: &Span,
        name_span: &Span,
    ) -> Item {
        let (line, col) = self.line_col(percent_span);

        match lower {
            "macro" => {
                let macro_name = match self.next() {
                    Some((Token::Ident(n), _)) => n.to_string(),
                    Some((other, s)) => {
                        self.diag(&s, format!("expected macro name but got {}", other));
                        other.literal()
                    }
                    None => {
                        self.diag(name_span, "expected macro name".to_string());
                        String::new()
                    }
                };

                let params = self.rest_of_line();
                let (body, _) = self.parse_items(&["endmacro"]);

                Item::Macro(MacroDef {
                    name: macro_name,
                    params,
                    body,
                    line,
                    col,
                })
            }

            "if" => {
                let cond = self.parse_expr();
                self.consume_line();

                let (then_items, end) = self.parse_items(&["else", "endif"]);

                let else_items = match end {
                    BlockEnd::Terminator(t) if t == "else" => {
                        let (items, _) = self.parse_items(&["endif"]);
                        items
                    }
                    _ => Vec::new(),
                };

                Item::If(IfBlock {
                    cond,
                    then_items,
                    else_items,
                    line,
                    col,
                })
            }

            _ => {
                let args = self.rest_of_line();
                Item::Directive {
                    name: format!("%{}", name),
                    args,
                    line,
                    col,
                }
            }
        }
    }

    fn consume_line(&mut self) {
        loop {
            match self.next() {
                Some((Token::Newline, _)) | None => return,
                Some(_) => continue,
            }
        }
    }

    /// Collects the literal text of every token through the end of the line.
    fn rest_of_line(&mut self) -> Vec<String> {
        let mut out = Vec::new();

        loop {
            match self.next() {
                Some((Token::Newline, _)) | None => break,
                Some((tok, _)) => out.push(tok.literal()),
            }
        }

        out
    }

    fn parse_data_items(&mut self) -> Vec<DataItem> {
        let mut out = Vec::new();

        loop {
            let (tok, span) = match self.next() {
                Some(t) => t,
                None => break,
            };

            match tok {
                Token::Newline => break,
                Token::Str(s) => out.push(DataItem::Str(s)),
                Token::Number(_)
                | Token::Ident(_)
                | Token::Plus
                | Token::Minus
                | Token::LParen => {
                    self.backup((tok, span));
                    out.push(DataItem::Expr(self.parse_expr()));

                    match self.next() {
                        Some((Token::Comma, _)) => continue,
                        Some(other) => self.backup(other),
                        None => {}
                    }
                }
                _ => {}
            }
        }

        out
    }

    fn parse_operands(&mut self) -> Vec<Operand> {
        let mut ops = Vec::new();

        loop {
            let (tok, span) = match self.next() {
                Some(t) => t,
                None => break,
            };

            match tok {
                Token::Newline => break,
                Token::Comma => continue,

                Token::Number(_) => {
                    self.backup((tok, span));
                    ops.push(Operand::Imm(self.parse_expr()));
                }

                Token::Hash => match self.next() {
                    Some((num @ Token::Number(_), nspan)) => {
                        self.backup((num, nspan));
                        ops.push(Operand::Imm(self.parse_expr()));
                    }
                    Some(other) => self.backup(other),
                    None => {}
                },

                Token::Str(s) => ops.push(Operand::Str(s)),

                Token::LBracket => {
                    let disp = self.parse_expr();
                    self.finish_bracket(&span);
                    ops.push(Operand::Mem(MemOperand { disp }));
                }

                Token::Ident(name) => {
                    if is_register(name) {
                        ops.push(Operand::Reg(name.to_string()));
                    } else {
                        ops.push(Operand::Label(name.to_string()));
                    }
                }

                _ => {}
            }
        }

        ops
    }

    /// Skips to the `]` closing a memory operand; the displacement
    /// expression has already been consumed.
    fn finish_bracket(&mut self, open: &Span) {
        loop {
            match self.next() {
                Some((Token::RBracket, _)) => return,
                Some((Token::Newline, span)) => {
                    // Leave the newline for the operand loop so a broken
                    // operand does not swallow the next statement.
                    self.backup((Token::Newline, span));
                    self.diag(open, "expected ']' to close memory operand".to_string());
                    return;
                }
                None => {
                    self.diag(open, "expected ']' to close memory operand".to_string());
                    return;
                }
                Some(_) => continue,
            }
        }
    }

    fn parse_expr(&mut self) -> Expr {
        let mut left = self.parse_term();

        loop {
            match self.next() {
                Some((Token::Plus, _)) => {
                    let right = self.parse_term();
                    left = Expr::Binary {
                        op: BinOp::Add,
                        lhs: Box::new(left),
                        rhs: Box::new(right),
                    };
                }
                Some((Token::Minus, _)) => {
                    let right = self.parse_term();
                    left = Expr::Binary {
                        op: BinOp::Sub,
                        lhs: Box::new(left),
                        rhs: Box::new(right),
                    };
                }
                Some(other) => {
                    self.backup(other);
                    break;
                }
                None => break,
            }
        }

        left
    }

    fn parse_term(&mut self) -> Expr {
        let mut left = self.parse_factor();

        loop {
            match self.next() {
                Some((Token::Star, _)) => {
                    let right = self.parse_factor();
                    left = Expr::Binary {
                        op: BinOp::Mul,
                        lhs: Box::new(left),
                        rhs: Box::new(right),
                    };
                }
                Some((Token::Slash, _)) => {
                    let right = self.parse_factor();
                    left = Expr::Binary {
                        op: BinOp::Div,
                        lhs: Box::new(left),
                        rhs: Box::new(right),
                    };
                }
                Some(other) => {
                    self.backup(other);
                    break;
                }
                None => break,
            }
        }

        left
    }

    fn parse_factor(&mut self) -> Expr {
        let (tok, span) = match self.next() {
            Some(t) => t,
            None => {
                let end = self.end..self.end;
                self.diag(&end, "unexpected end of input in expression".to_string());
                return Expr::Number(0);
            }
        };

        match tok {
            Token::Number(text) => match parse_number(text) {
                Ok(v) => Expr::Number(v),
                Err(_) => {
                    self.diag(&span, format!("parse_number: invalid number literal '{}'", text));
                    Expr::Number(0)
                }
            },
            Token::Ident(name) => Expr::Ident(name.to_string()),
            Token::Str(s) => Expr::Str(s),
            Token::LParen => {
                let e = self.parse_expr();
                match self.next() {
                    Some((Token::RParen, _)) => {}
                    Some((other, s)) => {
                        self.diag(&s, format!("expected ')' but got {}", other));
                        self.backup((other, s));
                    }
                    None => self.diag(&span, "expected ')'".to_string()),
                }
                e
            }
            Token::Plus => Expr::Unary {
                op: UnOp::Plus,
                expr: Box::new(self.parse_factor()),
            },
            Token::Minus => Expr::Unary {
                op: UnOp::Neg,
                expr: Box::new(self.parse_factor()),
            },
            other => {
                // Tolerate a stray token in factor position the way the rest
                // of the grammar does: consume it and use its literal as an
                // identifier.
                Expr::Ident(other.literal())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> File {
        parse_file(source).expect("parse failed")
    }

    #[test]
    fn labels_and_instructions() {
        let file = parse("_start:\n    xor rax, rax\n    ret\n");

        assert_eq!(file.items.len(), 3);
        assert_eq!(
            file.items[0],
            Item::Label {
                name: "_start".to_string(),
                line: 1,
                col: 1,
            }
        );

        match &file.items[1] {
            Item::Instruction(ins) => {
                assert_eq!(ins.mnemonic, "xor");
                assert_eq!(
                    ins.operands,
                    vec![
                        Operand::Reg("rax".to_string()),
                        Operand::Reg("rax".to_string()),
                    ]
                );
                assert_eq!(ins.line, 2);
            }
            other => panic!("expected instruction, got {:?}", other),
        }

        match &file.items[2] {
            Item::Instruction(ins) => assert!(ins.operands.is_empty()),
            other => panic!("expected instruction, got {:?}", other),
        }
    }

    #[test]
    fn mnemonic_case_is_preserved() {
        let file = parse("MOV rax, 1\n");

        match &file.items[0] {
            Item::Instruction(ins) => assert_eq!(ins.mnemonic, "MOV"),
            other => panic!("expected instruction, got {:?}", other),
        }
    }

    #[test]
    fn section_directive() {
        let file = parse("section .data\n");

        assert_eq!(
            file.items[0],
            Item::Directive {
                name: "section".to_string(),
                args: vec![".data".to_string()],
                line: 1,
                col: 1,
            }
        );
    }

    #[test]
    fn dot_directive() {
        let file = parse(".text\n");

        assert_eq!(
            file.items[0],
            Item::Directive {
                name: ".text".to_string(),
                args: vec![],
                line: 1,
                col: 1,
            }
        );
    }

    #[test]
    fn data_declaration() {
        let file = parse("db \"hi\", 10, 0\n");

        match &file.items[0] {
            Item::Data(decl) => {
                assert_eq!(decl.kind, DataKind::Db);
                assert_eq!(
                    decl.items,
                    vec![
                        DataItem::Str("hi".to_string()),
                        DataItem::Expr(Expr::Number(10)),
                        DataItem::Expr(Expr::Number(0)),
                    ]
                );
            }
            other => panic!("expected data decl, got {:?}", other),
        }
    }

    #[test]
    fn operand_classification() {
        let file = parse("mov rax, msg\nmov [buf], rcx\n");

        match &file.items[0] {
            Item::Instruction(ins) => {
                assert_eq!(
                    ins.operands,
                    vec![
                        Operand::Reg("rax".to_string()),
                        Operand::Label("msg".to_string()),
                    ]
                );
            }
            other => panic!("expected instruction, got {:?}", other),
        }

        match &file.items[1] {
            Item::Instruction(ins) => {
                assert_eq!(
                    ins.operands,
                    vec![
                        Operand::Mem(MemOperand {
                            disp: Expr::Ident("buf".to_string()),
                        }),
                        Operand::Reg("rcx".to_string()),
                    ]
                );
            }
            other => panic!("expected instruction, got {:?}", other),
        }
    }

    #[test]
    fn hash_immediate() {
        let file = parse("int #128\n");

        match &file.items[0] {
            Item::Instruction(ins) => {
                assert_eq!(ins.operands, vec![Operand::Imm(Expr::Number(128))]);
            }
            other => panic!("expected instruction, got {:?}", other),
        }
    }

    #[test]
    fn expression_precedence() {
        let file = parse("mov rax, 1 + 2 * 3\n");

        match &file.items[0] {
            Item::Instruction(ins) => match &ins.operands[1] {
                Operand::Imm(expr) => assert_eq!(expr.eval(), Ok(7)),
                other => panic!("expected immediate, got {:?}", other),
            },
            other => panic!("expected instruction, got {:?}", other),
        }
    }

    #[test]
    fn macro_block() {
        let file = parse("%macro exit 1\n    mov rax, 60\n    syscall\n%endmacro\n");

        match &file.items[0] {
            Item::Macro(m) => {
                assert_eq!(m.name, "exit");
                assert_eq!(m.params, vec!["1".to_string()]);
                assert_eq!(m.body.len(), 2);
            }
            other => panic!("expected macro, got {:?}", other),
        }
    }

    #[test]
    fn if_else_block() {
        let file = parse("%if LINUX\n    syscall\n%else\n    int 80h\n%endif\n");

        match &file.items[0] {
            Item::If(block) => {
                assert_eq!(block.cond, Expr::Ident("LINUX".to_string()));
                assert_eq!(block.then_items.len(), 1);
                assert_eq!(block.else_items.len(), 1);
            }
            other => panic!("expected if block, got {:?}", other),
        }
    }

    #[test]
    fn percent_directive() {
        let file = parse("%define X 1\n");

        match &file.items[0] {
            Item::Directive { name, args, .. } => {
                assert_eq!(name, "%define");
                assert_eq!(args, &["X".to_string(), "1".to_string()]);
            }
            other => panic!("expected directive, got {:?}", other),
        }
    }

    #[test]
    fn number_forms() {
        assert_eq!(parse_number("10"), Ok(10));
        assert_eq!(parse_number("0x1F"), Ok(31));
        assert_eq!(parse_number("0FFh"), Ok(255));
        assert_eq!(parse_number("0b101"), Ok(5));
        assert_eq!(parse_number("101b"), Ok(5));
        assert_eq!(parse_number("777o"), Ok(511));
        assert_eq!(parse_number("-42"), Ok(-42));
        assert!(parse_number("99999999999999999999").is_err());
    }

    #[test]
    fn number_overflow_is_a_diagnostic() {
        let err = parse_file("mov rax, 99999999999999999999\n").unwrap_err();

        assert_eq!(err.diagnostics.len(), 1);
        assert_eq!(err.diagnostics[0].line, 1);
        assert!(err.diagnostics[0].message.contains("parse_number"));
    }

    #[test]
    fn unclosed_memory_operand_is_a_diagnostic() {
        let err = parse_file("mov rax, [buf\n").unwrap_err();

        assert!(err.diagnostics[0].message.contains("']'"));
    }

    #[test]
    fn register_set() {
        assert!(is_register("rax"));
        assert!(is_register("RAX"));
        assert!(is_register("r15b"));
        assert!(is_register("xmm15"));
        assert!(is_register("rip"));
        assert!(is_register("cr0"));
        assert!(!is_register("msg"));
        assert!(!is_register("xmm16"));
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let file = parse("; leading comment\n\nnop ; trailing\n");

        assert_eq!(file.items.len(), 1);
    }
}
