#[derive(Clone, Debug)]
pub struct GitserverError(pub String);

pub fn gitserver_error(s: &str) -> GitserverError {
    GitserverError(s.to_owned())
}

impl std::fmt::Display for GitserverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GitserverError({})", self.0)
    }
}

pub type GitserverResult<T> = Result<T, GitserverError>;

impl<T> From<T> for GitserverError
where
    T: std::error::Error,
{
    fn from(item: T) -> Self {
        tracing::error!("GitserverError: {:?}", item);
        gitserver_error(&format!("converted {}", item))
    }
}
