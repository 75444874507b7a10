//! Raw-content base URLs for git hosting providers.

pub const DEFAULT_BRANCH: &str = "master";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'branch' and 'commit' cannot both be given")]
pub struct RevisionConflict;

/// Pick the revision segment: a branch or a commit, never both.
pub fn revision<'a>(branch: Option<&'a str>, commit: Option<&'a str>) -> Result<&'a str, RevisionConflict> {
    match (branch, commit) {
        (Some(_), Some(_)) => Err(RevisionConflict),
        (Some(b), None) => Ok(b),
        (None, Some(c)) => Ok(c),
        (None, None) => Ok(DEFAULT_BRANCH),
    }
}

pub fn github_url(user: &str, repo: &str, revision: &str) -> String {
    format!("https://raw.githubusercontent.com/{user}/{repo}/{revision}/")
}

pub fn bitbucket_url(user: &str, repo: &str, revision: &str) -> String {
    format!("https://bitbucket.org/{user}/{repo}/raw/{revision}/")
}

pub fn gitlab_url(user: &str, repo: &str, revision: &str, domain: Option<&str>) -> String {
    let domain = domain.unwrap_or("gitlab.com");
    format!("https://{domain}/{user}/{repo}/raw/{revision}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        assert_eq!(
            github_url("u", "r", revision(None, None).unwrap()),
            "https://raw.githubusercontent.com/u/r/master/"
        );
        assert_eq!(
            bitbucket_url("u", "r", revision(None, Some("abc123")).unwrap()),
            "https://bitbucket.org/u/r/raw/abc123/"
        );
        assert_eq!(
            gitlab_url("u", "r", "dev", Some("git.example.org")),
            "https://git.example.org/u/r/raw/dev"
        );
        assert_eq!(gitlab_url("u", "r", "dev", None), "https://gitlab.com/u/r/raw/dev");
    }

    #[test]
    fn test_branch_and_commit_conflict() {
        assert_eq!(revision(Some("b"), Some("c")), Err(RevisionConflict));
    }
}
