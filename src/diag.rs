use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Error,
    Warning,
    Note,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Error => "Error",
            Severity::Warning => "Warning",
            Severity::Note => "Note",
        })
    }
}

/// Messages collected while processing one image.
///
/// Owned by the call processing the image and returned with its report;
/// iteration always yields errors, then warnings, then notes, each in the
/// order they were raised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    errors: Vec<String>,
    warnings: Vec<String>,
    notes: Vec<String>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        match severity {
            Severity::Error => self.errors.push(message),
            Severity::Warning => self.warnings.push(message),
            Severity::Note => self.notes.push(message),
        }
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.push(Severity::Error, message);
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.push(Severity::Warning, message);
    }

    pub fn note(&mut self, message: impl Into<String>) {
        self.push(Severity::Note, message);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.notes.extend(other.notes);
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    pub fn len(&self) -> usize {
        self.errors.len() + self.warnings.len() + self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (Severity, &str)> {
        tagged(Severity::Error, &self.errors)
            .chain(tagged(Severity::Warning, &self.warnings))
            .chain(tagged(Severity::Note, &self.notes))
    }
}

fn tagged(severity: Severity, messages: &[String]) -> impl Iterator<Item = (Severity, &str)> {
    messages.iter().map(move |m| (severity, m.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterates_by_severity_then_insertion() {
        let mut diag = Diagnostics::new();
        diag.note("multiple firmware");
        diag.warning("checksum");
        diag.error("signature");
        diag.warning("padding");

        let order: Vec<_> = diag.iter().collect();
        assert_eq!(
            order,
            vec![
                (Severity::Error, "signature"),
                (Severity::Warning, "checksum"),
                (Severity::Warning, "padding"),
                (Severity::Note, "multiple firmware"),
            ]
        );
        assert_eq!(diag.len(), 4);
    }

    #[test]
    fn merging_keeps_order() {
        let mut a = Diagnostics::new();
        a.warning("first");
        let mut b = Diagnostics::new();
        b.error("late error");
        b.warning("second");
        a.extend(b);
        assert_eq!(a.errors(), ["late error"]);
        assert_eq!(a.warnings(), ["first", "second"]);
        assert!(!a.is_empty());
        assert!(Diagnostics::default().is_empty());
    }
}
