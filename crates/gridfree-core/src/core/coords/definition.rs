//! Text form of coordinate definitions.
//!
//! A definition is a comma-separated list of atom tuples, each optionally
//! followed by a parameter map:
//!
//! ```text
//! (0-1-2-4){'label':'backbone'}, (0-4){'weight':2.0, 'offset':1.5}
//! ```
//!
//! Four-atom tuples are dihedrals, two-atom tuples are linears. The `type`
//! parameter overrides the implied kind.

use super::CoordinateError;
use super::coordinate::{CoordinateKind, InternalCoordinate};

enum ParamValue {
    Text(String),
    Number(f64),
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            bytes: text.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> CoordinateError {
        CoordinateError::Parse {
            position: self.pos,
            message: message.into(),
        }
    }

    fn skip_ws(&mut self) {
        while let Some(b) = self.peek() {
            if b.is_ascii_whitespace() {
                self.pos += 1;
            } else if b == b'#' {
                while let Some(c) = self.peek() {
                    self.pos += 1;
                    if c == b'\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn eat(&mut self, expected: u8) -> bool {
        self.skip_ws();
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: u8) -> Result<(), CoordinateError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", expected as char)))
        }
    }

    fn take_while(&mut self, accept: impl Fn(u8) -> bool) -> &'a str {
        let bytes = self.bytes;
        let start = self.pos;
        while self.peek().is_some_and(&accept) {
            self.pos += 1;
        }
        // Only ASCII bytes are accepted by the callers.
        std::str::from_utf8(&bytes[start..self.pos]).unwrap_or_default()
    }

    fn integer(&mut self) -> Result<usize, CoordinateError> {
        self.skip_ws();
        let digits = self.take_while(|b| b.is_ascii_digit());
        digits
            .parse()
            .map_err(|_| self.error("expected atom index"))
    }

    fn number(&mut self) -> Result<f64, CoordinateError> {
        self.skip_ws();
        let raw = self.take_while(|b| b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.' | b'e' | b'E'));
        raw.parse()
            .map_err(|_| self.error(format!("invalid number '{raw}'")))
    }

    fn quoted(&mut self) -> Result<String, CoordinateError> {
        self.skip_ws();
        let quote = match self.peek() {
            Some(q @ (b'\'' | b'"')) => q,
            _ => return Err(self.error("expected quoted string")),
        };
        self.pos += 1;
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == quote {
                let text = String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned();
                self.pos += 1;
                return Ok(text);
            }
            self.pos += 1;
        }
        Err(self.error("unterminated string"))
    }

    fn key(&mut self) -> Result<String, CoordinateError> {
        self.skip_ws();
        match self.peek() {
            Some(b'\'' | b'"') => self.quoted(),
            _ => {
                let ident = self.take_while(|b| b.is_ascii_alphanumeric() || b == b'_');
                if ident.is_empty() {
                    Err(self.error("expected parameter name"))
                } else {
                    Ok(ident.to_string())
                }
            }
        }
    }

    fn value(&mut self) -> Result<ParamValue, CoordinateError> {
        self.skip_ws();
        match self.peek() {
            Some(b'\'' | b'"') => self.quoted().map(ParamValue::Text),
            _ => self.number().map(ParamValue::Number),
        }
    }

    fn atoms(&mut self) -> Result<Vec<usize>, CoordinateError> {
        self.expect(b'(')?;
        let mut atoms = vec![self.integer()?];
        while self.eat(b'-') {
            atoms.push(self.integer()?);
        }
        self.expect(b')')?;
        Ok(atoms)
    }

    fn params(&mut self) -> Result<Vec<(String, ParamValue)>, CoordinateError> {
        let mut params = Vec::new();
        if !self.eat(b'{') {
            return Ok(params);
        }
        if self.eat(b'}') {
            return Ok(params);
        }
        loop {
            let key = self.key()?;
            self.expect(b':')?;
            params.push((key, self.value()?));
            if self.eat(b'}') {
                return Ok(params);
            }
            self.expect(b',')?;
        }
    }
}

/// Parses a coordinate definition into an ordered list of coordinates.
pub fn parse_definition(text: &str) -> Result<Vec<InternalCoordinate>, CoordinateError> {
    let mut cursor = Cursor::new(text);
    let mut coords = Vec::new();
    let mut seen_linear = false;

    loop {
        cursor.skip_ws();
        if cursor.at_end() {
            break;
        }
        let index = coords.len();
        let atoms = cursor.atoms()?;
        let params = cursor.params()?;

        let explicit_kind = params
            .iter()
            .find(|(key, _)| key == "type")
            .map(|(_, value)| match value {
                ParamValue::Text(tag) => {
                    CoordinateKind::from_tag(tag).ok_or_else(|| CoordinateError::UnknownKind(tag.clone()))
                }
                ParamValue::Number(n) => Err(CoordinateError::UnknownKind(n.to_string())),
            })
            .transpose()?;

        let kind = match explicit_kind {
            Some(kind) => kind,
            None => {
                let kind = CoordinateKind::for_atom_count(atoms.len()).ok_or(
                    CoordinateError::AtomCount {
                        index,
                        kind: CoordinateKind::Linear,
                        expected: 2,
                        found: atoms.len(),
                    },
                )?;
                if kind == CoordinateKind::Dihedral && seen_linear {
                    return Err(CoordinateError::DihedralAfterLinear { index });
                }
                kind
            }
        };
        if atoms.len() != kind.atom_count() {
            return Err(CoordinateError::AtomCount {
                index,
                kind,
                expected: kind.atom_count(),
                found: atoms.len(),
            });
        }

        let mut coord = match kind {
            CoordinateKind::Dihedral => {
                InternalCoordinate::dihedral([atoms[0], atoms[1], atoms[2], atoms[3]])
            }
            CoordinateKind::Linear => InternalCoordinate::linear(atoms[0], atoms[1]),
        };
        for (key, value) in params {
            coord = match (key.as_str(), value, kind) {
                ("type", _, _) => coord,
                ("label", ParamValue::Text(label), _) => coord.with_label(label),
                ("weight", ParamValue::Number(w), CoordinateKind::Linear) => coord.with_weight(w),
                ("offset", ParamValue::Number(o), CoordinateKind::Linear) => coord.with_offset(o),
                _ => {
                    return Err(CoordinateError::UnsupportedParameter {
                        index,
                        kind,
                        parameter: key.clone(),
                    });
                }
            };
        }
        seen_linear |= kind == CoordinateKind::Linear;
        coords.push(coord);

        if !cursor.eat(b',') {
            cursor.skip_ws();
            if !cursor.at_end() {
                return Err(cursor.error("expected ',' between coordinates"));
            }
        }
    }
    Ok(coords)
}

/// Formats coordinates in the definition syntax accepted by [`parse_definition`].
///
/// Weights and offsets are only written when they differ from their defaults.
/// A dihedral listed after a linear carries an explicit `type` entry so the
/// text parses back to the same list.
pub fn format_definition(coords: &[InternalCoordinate]) -> String {
    let mut seen_linear = false;
    let mut items = Vec::with_capacity(coords.len());
    for coord in coords {
        let atoms = coord
            .atoms()
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join("-");
        let mut props = Vec::new();
        if coord.is_dihedral() && seen_linear {
            props.push(format!("'type':'{}'", coord.kind().tag()));
        }
        if let Some(label) = coord.explicit_label() {
            props.push(format!("'label':'{label}'"));
        }
        if !coord.is_dihedral() {
            if coord.weight() != 1.0 {
                props.push(format!("'weight':{:?}", coord.weight()));
            }
            if coord.offset() != 0.0 {
                props.push(format!("'offset':{:?}", coord.offset()));
            }
        }
        seen_linear |= !coord.is_dihedral();

        if props.is_empty() {
            items.push(format!("({atoms})"));
        } else {
            items.push(format!("({atoms}){{{}}}", props.join(", ")));
        }
    }
    items.join(",\n")
}
