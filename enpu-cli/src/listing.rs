use std::fmt::{self, Display};

/// Aligns name/value rows under a section heading.
pub struct Listing {
    heading: &'static str,
    rows: Vec<(String, String)>,
}

impl Listing {
    pub fn new(heading: &'static str) -> Self {
        Self {
            heading,
            rows: Vec::new(),
        }
    }

    pub fn row(&mut self, name: impl Into<String>, value: impl Display) {
        self.rows.push((name.into(), value.to_string()));
    }
}

impl Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.heading)?;

        let width = self
            .rows
            .iter()
            .map(|(name, _)| name.len())
            .max()
            .unwrap_or(0);

        for (name, value) in &self.rows {
            writeln!(f, "  {name:<width$}  {value}")?;
        }

        Ok(())
    }
}
