#[cfg(test)]
mod harness;
#[cfg(test)]
mod test;

fn main() {
    println!("Run me via `cargo nextest run` or `cargo test`");
}
