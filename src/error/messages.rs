use super::ErrorKind;

/// The one message shown to users for each error kind.
///
/// Raw messages and traces never reach the user; they are logged instead.
pub fn user_friendly_message(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Network => {
            "Connection problem. Check your internet connection and try again."
        }
        ErrorKind::Validation => "Some of the information provided is invalid. Please review it.",
        ErrorKind::Authentication => "Your session has expired. Please sign in again.",
        ErrorKind::Authorization => "You do not have permission to perform this action.",
        ErrorKind::NotFound => "The requested item could not be found.",
        ErrorKind::Server => "Our servers are having trouble. Please try again in a few minutes.",
        ErrorKind::Client => "The request could not be completed. Please try again.",
        ErrorKind::Upload => "The file upload failed. Please try uploading it again.",
        ErrorKind::Payment => {
            "There was a problem processing your payment. No charge was confirmed; please try again."
        }
        ErrorKind::Unknown => "Something went wrong. Please try again.",
    }
}
