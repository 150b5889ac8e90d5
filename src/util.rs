pub fn estimate_tokens_for_text(text: &str) -> usize {
    // Simple heuristic: 1 token ~ 4 characters
    let chars = text.chars().count();
    (chars + 3) / 4
}
