use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VocabularyError {
    #[error("Failed to read labels: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid line format at line {line}: {content}")]
    InvalidLine { line: usize, content: String },
    #[error("Invalid {channel} value at line {line}")]
    InvalidColor { line: usize, channel: &'static str },
    #[error("Duplicate label `{0}`")]
    Duplicate(String),
    #[error("Labels file is empty")]
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColorLabel {
    pub label: String,
    pub color: [u8; 3],
}

/// Fixed, enumerated set of labels a detector can report. Class id is the
/// position in the list.
#[derive(Debug, Clone, PartialEq)]
pub struct Vocabulary {
    labels: Vec<ColorLabel>,
}

impl Vocabulary {
    pub fn new(labels: Vec<ColorLabel>) -> Result<Self, VocabularyError> {
        if labels.is_empty() {
            return Err(VocabularyError::Empty);
        }
        for (i, entry) in labels.iter().enumerate() {
            if labels[..i].iter().any(|other| other.label == entry.label) {
                return Err(VocabularyError::Duplicate(entry.label.clone()));
            }
        }
        Ok(Self { labels })
    }

    pub fn load(path: &Path) -> Result<Self, VocabularyError> {
        let file = File::open(path)?;
        Self::from_reader(io::BufReader::new(file))
    }

    /// Parses `label,red,green,blue` lines. Blank lines are skipped.
    pub fn from_reader(reader: impl BufRead) -> Result<Self, VocabularyError> {
        let mut labels = Vec::new();

        for (index, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            let line_number = index + 1;
            if line.trim().is_empty() {
                continue;
            }

            let parts: Vec<&str> = line.split(',').collect();
            if parts.len() != 4 {
                return Err(VocabularyError::InvalidLine {
                    line: line_number,
                    content: line,
                });
            }

            let channel = |value: &str, name: &'static str| {
                value
                    .trim()
                    .parse::<u8>()
                    .map_err(|_| VocabularyError::InvalidColor {
                        line: line_number,
                        channel: name,
                    })
            };

            labels.push(ColorLabel {
                label: parts[0].trim().to_string(),
                color: [
                    channel(parts[1], "red")?,
                    channel(parts[2], "green")?,
                    channel(parts[3], "blue")?,
                ],
            });
        }

        Self::new(labels)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.labels.iter().any(|entry| entry.label == label)
    }

    pub fn label(&self, class_id: usize) -> Option<&ColorLabel> {
        self.labels.get(class_id)
    }

    pub fn color_of(&self, label: &str) -> Option<[u8; 3]> {
        self.labels
            .iter()
            .find(|entry| entry.label == label)
            .map(|entry| entry.color)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_labels_with_colors() {
        let data = "person, 89, 161, 197\n\ntraffic light,67,161,255\n";
        let vocabulary = Vocabulary::from_reader(Cursor::new(data)).unwrap();

        assert_eq!(vocabulary.len(), 2);
        assert!(vocabulary.contains("traffic light"));
        assert!(!vocabulary.contains("spaceship"));
        assert_eq!(vocabulary.label(0).unwrap().label, "person");
        assert_eq!(vocabulary.color_of("traffic light"), Some([67, 161, 255]));
    }

    #[test]
    fn rejects_malformed_lines() {
        let err = Vocabulary::from_reader(Cursor::new("person,1,2\n")).unwrap_err();
        assert!(matches!(err, VocabularyError::InvalidLine { line: 1, .. }));

        let err = Vocabulary::from_reader(Cursor::new("person,1,2,300\n")).unwrap_err();
        assert!(matches!(
            err,
            VocabularyError::InvalidColor {
                line: 1,
                channel: "blue"
            }
        ));
    }

    #[test]
    fn rejects_duplicates_and_empty_files() {
        let err = Vocabulary::from_reader(Cursor::new("cat,1,1,1\ncat,2,2,2\n")).unwrap_err();
        assert!(matches!(err, VocabularyError::Duplicate(label) if label == "cat"));

        let err = Vocabulary::from_reader(Cursor::new("\n")).unwrap_err();
        assert!(matches!(err, VocabularyError::Empty));
    }
}
