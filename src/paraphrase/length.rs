/// Output token budget relative to the encoded prompt. One token is roughly
/// 3-4 characters of Indonesian, so keeping the token count close keeps the
/// paraphrase close to the source length.
const MIN_RATIO: f64 = 0.9;
const MAX_RATIO: f64 = 1.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthBounds {
    pub min_length: usize,
    pub max_length: usize,
}

impl LengthBounds {
    pub fn for_input(input_token_len: usize) -> Self {
        let len = input_token_len as f64;
        Self {
            min_length: (len * MIN_RATIO).floor() as usize,
            max_length: (len * MAX_RATIO).floor() as usize,
        }
    }
}
