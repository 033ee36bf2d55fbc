//! Random ID generation with a safe alphabet.

/// Alphabet excluding vowels and ambiguous characters (I, O, U, A, E) to prevent
/// accidentally generating offensive or confusable strings.
const ID_ALPHABET: [char; 31] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'B', 'C', 'D', 'F', 'G', 'H', 'J', 'K', 'L',
    'M', 'N', 'P', 'Q', 'R', 'S', 'T', 'V', 'W', 'X', 'Y', 'Z',
];

/// Length of the request ids stamped onto every inbound request.
pub const REQUEST_ID_LENGTH: usize = 12;

/// Generates a random ID of the specified length using a safe alphabet.
///
/// The alphabet excludes vowels to avoid generating offensive words,
/// and excludes ambiguous characters (I/1, O/0) for better readability.
pub fn generate_id(len: usize) -> String {
    nanoid::format(nanoid::rngs::default, &ID_ALPHABET, len)
}

/// Generates the id attached to one inbound request and carried through its
/// request context, logs, and audit records.
pub fn generate_request_id() -> String {
    generate_id(REQUEST_ID_LENGTH)
}
