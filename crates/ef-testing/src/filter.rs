use regex::Regex;
use serde::Deserialize;
use std::{collections::BTreeMap, fs, path::Path};

type Folder = String;
type FilterMap = BTreeMap<Folder, Vec<String>>;

/// Filter to be applied on the fixture files
#[derive(Debug, Deserialize, Default)]
pub struct Filter {
    /// List of directories that should be skipped. e.g.: `osaka`.
    #[serde(default)]
    directories: Vec<String>,
    /// Mapping containing the directories and the files that should be skipped
    #[serde(default)]
    filename: FilterMap,
    /// Mapping containing the directories and the regex patterns that should be skipped
    #[serde(default)]
    regex: FilterMap,
    /// Mapping containing the directories and the specific fixtures that should be skipped
    #[serde(default, rename = "testname")]
    test_name: FilterMap,
    #[serde(skip)]
    compiled: BTreeMap<Folder, Vec<Regex>>,
}

impl Filter {
    pub fn load_file(path: &Path) -> Result<Self, eyre::Error> {
        let filter = fs::read_to_string(path)?;
        Self::from_yaml(&filter)
    }

    pub fn from_yaml(input: &str) -> Result<Self, eyre::Error> {
        let mut filter: Self = serde_yaml::from_str(input)?;
        filter.compiled = filter
            .regex
            .iter()
            .map(|(folder, patterns)| {
                let regexes = patterns
                    .iter()
                    .map(|pattern| Regex::new(pattern))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((folder.clone(), regexes))
            })
            .collect::<Result<_, regex::Error>>()?;
        Ok(filter)
    }

    /// Checks if the fixture file at `path`, or the fixture `case_name` inside
    /// it, is inside the filter object
    pub fn is_skipped(&self, path: &Path, case_name: Option<&str>) -> bool {
        let stem = |path: Option<&Path>| {
            path.and_then(Path::file_stem)
                .and_then(|s| s.to_str())
                .map(ToString::to_string)
                .unwrap_or_default()
        };
        let dir_name = stem(path.parent());
        let file_name = stem(Some(path));

        if path.components().any(|component| {
            let component = component.as_os_str().to_string_lossy();
            self.directories.iter().any(|dir| component == dir.as_str())
        }) {
            return true;
        }

        let mut should_skip = self
            .filename
            .get(&dir_name)
            .map(|filtered_files| filtered_files.iter().any(|filename| filename == &file_name))
            .unwrap_or_default();

        should_skip |= self
            .compiled
            .get(&dir_name)
            .map(|regexes| regexes.iter().any(|regex| regex.is_match(&file_name)))
            .unwrap_or_default();

        if let Some(case_name) = case_name {
            should_skip |= self
                .test_name
                .get(&dir_name)
                .map(|tests| tests.iter().any(|test| test == case_name))
                .unwrap_or_default();
        }

        should_skip
    }
}
